//! G.711 µ-law (PCMU) für den Audio-Pfad
//!
//! Capture und Playback laufen mit 48 kHz, PCMU mit 8 kHz. Ein 20ms-Frame
//! sind 960 Samples intern bzw. 160 Bytes auf der Leitung.

/// Taktrate von PCMU
pub const PCMU_CLOCK_RATE: u32 = 8000;

/// 48 kHz / 8 kHz
const RESAMPLE_RATIO: usize = 6;

const BIAS: i32 = 0x84;
const CLIP: i32 = 32635;

/// Kodiert einen 48 kHz Frame (f32, -1.0..=1.0) als PCMU Payload
pub fn encode_pcmu(samples: &[f32]) -> Vec<u8> {
    samples
        .chunks(RESAMPLE_RATIO)
        .map(|chunk| {
            // Mittelwert als einfacher Tiefpass vor dem Downsampling
            let mean = chunk.iter().sum::<f32>() / chunk.len() as f32;
            linear_to_ulaw(f32_to_i16(mean))
        })
        .collect()
}

/// Dekodiert PCMU Payload zu 48 kHz Samples
pub fn decode_pcmu(payload: &[u8]) -> Vec<f32> {
    let decoded: Vec<f32> = payload
        .iter()
        .map(|&byte| i16_to_f32(ulaw_to_linear(byte)))
        .collect();

    // Lineares Upsampling auf 48 kHz
    let mut out = Vec::with_capacity(decoded.len() * RESAMPLE_RATIO);
    for (i, &s1) in decoded.iter().enumerate() {
        let s2 = decoded.get(i + 1).copied().unwrap_or(s1);
        for step in 0..RESAMPLE_RATIO {
            let frac = step as f32 / RESAMPLE_RATIO as f32;
            out.push(s1 + (s2 - s1) * frac);
        }
    }
    out
}

pub fn linear_to_ulaw(sample: i16) -> u8 {
    let mut pcm = i32::from(sample);
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0
    };
    pcm = pcm.min(CLIP) + BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && pcm & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (pcm >> (exponent + 3)) & 0x0F;

    !((sign | (exponent << 4) | mantissa) as u8)
}

pub fn ulaw_to_linear(byte: u8) -> i16 {
    let byte = !byte;
    let sign = byte & 0x80;
    let exponent = i32::from((byte >> 4) & 0x07);
    let mantissa = i32::from(byte & 0x0F);

    let magnitude = (((mantissa << 3) + BIAS) << exponent) - BIAS;
    let sample = if sign != 0 { -magnitude } else { magnitude };
    sample as i16
}

fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16
}

fn i16_to_f32(sample: i16) -> f32 {
    f32::from(sample) / 32768.0
}

// ============================================================================
// TESTS
// ============================================================================
