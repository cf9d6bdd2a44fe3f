//! PMBus LINEAR11 and LINEAR16 number formats.
//!
//! LINEAR11 packs a 5-bit two's complement exponent over an 11-bit two's
//! complement mantissa. LINEAR16 is an unsigned 16-bit mantissa whose
//! exponent lives in the low five bits of `VOUT_MODE`.

fn sign_extend(value: u16, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((value as i32) << shift) >> shift
}

/// Exponent carried by a `VOUT_MODE` byte.
pub fn vout_mode_exponent(vout_mode: u8) -> i32 {
    sign_extend((vout_mode & 0x1f) as u16, 5)
}

pub fn l11_to_float(value: u16) -> f32 {
    let exponent = sign_extend(value >> 11, 5);
    let mantissa = sign_extend(value & 0x7ff, 11);
    mantissa as f32 * 2.0_f32.powi(exponent)
}

/// Encodes `value` picking the exponent with the smallest rounding error.
pub fn float_to_l11(value: f32) -> u16 {
    if value == 0.0 || !value.is_finite() {
        return 0;
    }

    let mut best: Option<(i32, i32, f32)> = None;
    for exponent in -16..=15 {
        let mantissa = (value / 2.0_f32.powi(exponent)).round();
        if !(-1024.0..=1023.0).contains(&mantissa) {
            continue;
        }
        let error = (mantissa * 2.0_f32.powi(exponent) - value).abs();
        if best.is_none_or(|(_, _, e)| error < e) {
            best = Some((exponent, mantissa as i32, error));
        }
    }

    // Out of range: saturate at the largest magnitude with exponent 15.
    let (exponent, mantissa) = match best {
        Some((exponent, mantissa, _)) => (exponent, mantissa),
        None if value > 0.0 => (15, 1023),
        None => (15, -1024),
    };
    (((exponent as u16) & 0x1f) << 11) | ((mantissa as u16) & 0x7ff)
}

pub fn l16_to_float(value: u16, vout_mode: u8) -> f32 {
    value as f32 * 2.0_f32.powi(vout_mode_exponent(vout_mode))
}

/// Negative values encode as zero, large ones saturate.
pub fn float_to_l16(value: f32, vout_mode: u8) -> u16 {
    let scaled = (value / 2.0_f32.powi(vout_mode_exponent(vout_mode))).round();
    if scaled.is_nan() || scaled <= 0.0 {
        0
    } else if scaled >= u16::MAX as f32 {
        u16::MAX
    } else {
        scaled as u16
    }
}
