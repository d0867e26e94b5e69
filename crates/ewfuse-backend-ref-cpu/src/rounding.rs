use ewfuse::DType;

/// Combined three-component Tausworthe generator, bit-compatible with the
/// device `urand_gen` helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Tausworthe {
    s: [u32; 3],
}

impl Tausworthe {
    pub(crate) fn new(s0: u32, s1: u32, s2: u32) -> Self {
        Self { s: [s0, s1, s2] }
    }

    pub(crate) fn next_u32(&mut self) -> u32 {
        let [s0, s1, s2] = &mut self.s;
        *s0 = ((*s0 & 0xffff_fffe) << 12) ^ (((*s0 << 13) ^ *s0) >> 19);
        *s1 = ((*s1 & 0xffff_fff8) << 4) ^ (((*s1 << 2) ^ *s1) >> 25);
        *s2 = ((*s2 & 0xffff_fff0) << 11) ^ (((*s2 << 3) ^ *s2) >> 11);
        *s0 ^ *s1 ^ *s2
    }

    /// Uniform float in `[0, 1)`.
    pub(crate) fn next_f32(&mut self) -> f32 {
        (self.next_u32() as f64 * 2f64.powi(-32)) as f32
    }

    /// Word written back to the persistent state pool.
    pub(crate) fn fold(&self) -> u32 {
        self.s[0] ^ self.s[1] ^ self.s[2]
    }
}

/// Converts an f64 to f32 rounding toward zero.
fn to_f32_rz(value: f64) -> f32 {
    let mut out = value as f32;
    if out.is_finite() && (out as f64).abs() > value.abs() {
        // sign-magnitude layout: decrementing the bits moves toward zero
        out = f32::from_bits(out.to_bits() - 1);
    }
    out
}

/// Adds uniform noise below the kept mantissa bits, then truncates them away.
fn stochastic_f32(value: f32, rng: &mut Tausworthe, mantissa_bits: u32) -> f32 {
    if !value.is_finite() {
        return value;
    }
    let exponent = f32::from_bits(value.to_bits() & 0xff80_0000) as f64;
    let noise = exponent * 2f64.powi(-32 - mantissa_bits as i32) * rng.next_u32() as f64;
    let mask = u32::MAX << (23 - mantissa_bits);
    f32::from_bits(to_f32_rz(value as f64 + noise).to_bits() & mask)
}

fn stochastic_int(value: f32, rng: &mut Tausworthe) -> f64 {
    let noise = (rng.next_u32() as f64 * 2f64.powi(-32)).copysign(value as f64);
    (value as f64 + noise).trunc()
}

fn f16_bits(value: f32) -> u32 {
    half::f16::from_f32(value).to_bits() as u32
}

/// Narrows a float register into `dtype`'s raw bits.
///
/// `stochastic` carries the generator and mantissa width when the store rounds
/// stochastically; unsigned targets always round to nearest.
pub(crate) fn narrow(
    dtype: DType,
    value: f32,
    stochastic: Option<(&mut Tausworthe, u32)>,
) -> u32 {
    match (dtype, stochastic) {
        (DType::F32, None) => value.to_bits(),
        (DType::F32, Some((rng, bits))) => stochastic_f32(value, rng, bits).to_bits(),
        (DType::F16, None) => f16_bits(value),
        (DType::F16, Some((rng, bits))) => f16_bits(stochastic_f32(value, rng, bits)),
        (DType::Si32, Some((rng, _))) => stochastic_int(value, rng) as i32 as u32,
        (DType::Si16, Some((rng, _))) => stochastic_int(value, rng) as i16 as u16 as u32,
        (DType::Si8, Some((rng, _))) => stochastic_int(value, rng) as i8 as u8 as u32,
        (DType::Si32, None) => value.round_ties_even() as i32 as u32,
        (DType::Si16, None) => value.round_ties_even() as i16 as u16 as u32,
        (DType::Si8, None) => value.round_ties_even() as i8 as u8 as u32,
        (DType::Ui32, _) => value.round_ties_even() as u32,
        (DType::Ui16, _) => value.round_ties_even() as u16 as u32,
        (DType::Ui8, _) => value.round_ties_even() as u8 as u32,
    }
}

/// Stores an integer index register without going through a float.
pub(crate) fn narrow_index(dtype: DType, index: i32) -> u32 {
    match dtype {
        DType::F32 => (index as f32).to_bits(),
        DType::F16 => f16_bits(index as f32),
        _ => index as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generator_never_sticks() {
        let mut rng = Tausworthe::new(0x1234_5680, 0x9abc_def8, 0x0fed_cba0);
        let draws: Vec<u32> = (0..64).map(|_| rng.next_u32()).collect();
        let mut unique = draws.clone();
        unique.sort_unstable();
        unique.dedup();
        assert!(unique.len() > 60);
        assert!((0..1000).all(|_| (0.0..1.0).contains(&rng.next_f32())));
    }

    #[test]
    fn nearest_integer_stores_round_half_to_even() {
        assert_eq!(narrow(DType::Si32, 2.5, None), 2);
        assert_eq!(narrow(DType::Si32, -1.5, None) as i32, -2);
        assert_eq!(narrow(DType::Ui8, 300.0, None), 255);
        assert_eq!(narrow(DType::Ui16, -4.0, None), 0);
    }

    #[test]
    fn stochastic_f16_lands_on_a_neighbour() {
        let mut rng = Tausworthe::new(0xdead_bea0, 0x1357_9bd8, 0x2468_ace0);
        let value = 1.0 + 2f32.powi(-12);
        let lo = f16_bits(1.0);
        let hi = f16_bits(1.0 + 2f32.powi(-10));
        let mut ups = 0;
        for _ in 0..4096 {
            let bits = narrow(DType::F16, value, Some((&mut rng, 10)));
            assert!(bits == lo || bits == hi);
            ups += usize::from(bits == hi);
        }
        // one quarter of the draws should round up
        assert!((800..1250).contains(&ups), "{ups}");
    }

    #[test]
    fn stochastic_integers_truncate_after_noise() {
        let mut rng = Tausworthe::new(0x8000_0080, 0x8000_0088, 0x8000_0090);
        for _ in 0..100 {
            let v = narrow(DType::Si32, 3.0, Some((&mut rng, 0))) as i32;
            assert_eq!(v, 3);
            let v = narrow(DType::Si16, -2.25, Some((&mut rng, 0))) as u16 as i16;
            assert!(v == -2 || v == -3);
        }
    }
}
