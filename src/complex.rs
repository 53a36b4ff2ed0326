#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Complex<T> {
    pub re: T,
    pub im: T,
}

impl<T> Complex<T> {
    pub fn new(re: T, im: T) -> Self {
        Self { re, im }
    }
}

/// One SC16 Q11 sample pair as delivered by the radio (12 bits of ADC in an i16)
pub type IqSample = Complex<i16>;

/// The 8-bit pair the demodulator reads out of the cyclic buffer
pub type ComplexByte = Complex<u8>;

/// Drop a 12-bit sample to the 8-bit magnitude-preserving value the demodulator expects.
/// Applied unconditionally, whatever format the stream was configured with.
pub fn shift_down(sample: i16) -> u8 {
    ((sample >> 4) & 0xFF) as u8
}

impl IqSample {
    pub fn to_bytes(self) -> ComplexByte {
        Complex::new(shift_down(self.re), shift_down(self.im))
    }
}

/// Iterate interleaved `I, Q, I, Q, ...` words as sample pairs. A trailing odd word is ignored.
pub fn iq_pairs(interleaved: &[i16]) -> impl Iterator<Item = IqSample> + '_ {
    interleaved
        .chunks_exact(2)
        .map(|pair| IqSample::new(pair[0], pair[1]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shift_down() {
        assert_eq!(shift_down(0), 0);
        assert_eq!(shift_down(2047), 0x7F);
        assert_eq!(shift_down(16), 1);
        // Arithmetic shift keeps the sign bits, the mask keeps the low byte
        assert_eq!(shift_down(-2048), 0x80);
        assert_eq!(shift_down(-1), 0xFF);
        assert_eq!(shift_down(-16), 0xFF);
        assert_eq!(shift_down(-17), 0xFE);
    }

    #[test]
    fn test_pairs() {
        let words = [160i16, -160, 32, 48, 7];
        let bytes: Vec<ComplexByte> = iq_pairs(&words).map(IqSample::to_bytes).collect();
        assert_eq!(
            bytes,
            vec![Complex::new(10u8, 0xF6), Complex::new(2u8, 3)]
        );
    }
}
