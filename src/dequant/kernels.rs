//! Block dequantization kernels: quantized tensor bytes to float32.
//!
//! Layouts follow the ggml block formats. All kernels consume whole blocks;
//! callers guarantee the element count is a multiple of the block size.

use half::f16;
use thiserror::Error;

use super::gguf::GgmlDtype;

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("Element count {elems} is not a multiple of block size {block} for {dtype:?}")]
    RaggedBlock {
        dtype: GgmlDtype,
        elems: usize,
        block: usize,
    },

    #[error("Source is {actual} bytes, expected {expected} for {elems} elements of {dtype:?}")]
    SizeMismatch {
        dtype: GgmlDtype,
        elems: usize,
        expected: usize,
        actual: usize,
    },
}

/// Dequantize `elems` values of `dtype` from `src` into f32.
pub fn dequantize(dtype: GgmlDtype, src: &[u8], elems: usize) -> Result<Vec<f32>, KernelError> {
    let block = dtype.block_elems();
    if elems % block != 0 {
        return Err(KernelError::RaggedBlock {
            dtype,
            elems,
            block,
        });
    }
    let expected = dtype.row_bytes(elems);
    if src.len() != expected {
        return Err(KernelError::SizeMismatch {
            dtype,
            elems,
            expected,
            actual: src.len(),
        });
    }

    let mut dst = Vec::with_capacity(elems);
    match dtype {
        GgmlDtype::F32 => {
            for chunk in src.chunks_exact(4) {
                dst.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
            }
        }
        GgmlDtype::F16 => {
            for chunk in src.chunks_exact(2) {
                dst.push(f16::from_le_bytes([chunk[0], chunk[1]]).to_f32());
            }
        }
        GgmlDtype::Q4_0 => dequantize_q4_0(src, &mut dst),
        GgmlDtype::Q5_0 => dequantize_q5_0(src, &mut dst),
        GgmlDtype::Q8_0 => dequantize_q8_0(src, &mut dst),
        GgmlDtype::Q5K => dequantize_q5_k(src, &mut dst),
    }
    Ok(dst)
}

fn f16_at(src: &[u8], offset: usize) -> f32 {
    f16::from_le_bytes([src[offset], src[offset + 1]]).to_f32()
}

/// Q4_0: 32 elements per block; f16 scale, 16 bytes of packed nibbles.
/// value = (nibble - 8) * d, low nibbles first half, high nibbles second.
fn dequantize_q4_0(src: &[u8], dst: &mut Vec<f32>) {
    for block in src.chunks_exact(18) {
        let d = f16_at(block, 0);
        let qs = &block[2..18];
        for &q in qs {
            dst.push(((q & 0x0F) as i32 - 8) as f32 * d);
        }
        for &q in qs {
            dst.push(((q >> 4) as i32 - 8) as f32 * d);
        }
    }
}

/// Q5_0: 32 elements per block; f16 scale, 32 packed high bits, 16 nibble
/// bytes. value = (q5 - 16) * d.
fn dequantize_q5_0(src: &[u8], dst: &mut Vec<f32>) {
    for block in src.chunks_exact(22) {
        let d = f16_at(block, 0);
        let qh = u32::from_le_bytes([block[2], block[3], block[4], block[5]]);
        let qs = &block[6..22];
        for (i, &q) in qs.iter().enumerate() {
            let hi = ((qh >> i) & 1) as u8;
            let q5 = (q & 0x0F) | (hi << 4);
            dst.push((q5 as i32 - 16) as f32 * d);
        }
        for (i, &q) in qs.iter().enumerate() {
            let hi = ((qh >> (i + 16)) & 1) as u8;
            let q5 = (q >> 4) | (hi << 4);
            dst.push((q5 as i32 - 16) as f32 * d);
        }
    }
}

/// Q8_0: 32 elements per block; f16 scale, 32 signed bytes. value = q * d.
fn dequantize_q8_0(src: &[u8], dst: &mut Vec<f32>) {
    for block in src.chunks_exact(34) {
        let d = f16_at(block, 0);
        for &q in &block[2..34] {
            dst.push((q as i8) as f32 * d);
        }
    }
}

/// Unpack the 6-bit scale/min pair `j` from a Q5_K scale table.
fn scale_min_k4(j: usize, scales: &[u8]) -> (u8, u8) {
    if j < 4 {
        (scales[j] & 63, scales[j + 4] & 63)
    } else {
        (
            (scales[j + 4] & 0x0F) | ((scales[j - 4] >> 6) << 4),
            (scales[j + 4] >> 4) | ((scales[j] >> 6) << 4),
        )
    }
}

/// Q5_K: 256-element super-block of 8 sub-blocks; f16 d and dmin, 12 bytes
/// of packed 6-bit scales/mins, 32 bytes of high bits, 128 nibble bytes.
/// value = d*scale*q5 - dmin*min.
fn dequantize_q5_k(src: &[u8], dst: &mut Vec<f32>) {
    for block in src.chunks_exact(176) {
        let d = f16_at(block, 0);
        let dmin = f16_at(block, 2);
        let scales = &block[4..16];
        let qh = &block[16..48];
        let qs = &block[48..176];

        let mut is = 0usize;
        let mut u1: u8 = 1;
        let mut u2: u8 = 2;
        let mut ql = 0usize;
        for _ in (0..256).step_by(64) {
            let (sc, m) = scale_min_k4(is, scales);
            let d1 = d * sc as f32;
            let m1 = dmin * m as f32;
            let (sc, m) = scale_min_k4(is + 1, scales);
            let d2 = d * sc as f32;
            let m2 = dmin * m as f32;

            for l in 0..32 {
                let q = (qs[ql + l] & 0x0F) + if qh[l] & u1 != 0 { 16 } else { 0 };
                dst.push(d1 * q as f32 - m1);
            }
            for l in 0..32 {
                let q = (qs[ql + l] >> 4) + if qh[l] & u2 != 0 { 16 } else { 0 };
                dst.push(d2 * q as f32 - m2);
            }
            ql += 32;
            is += 2;
            u1 <<= 2;
            u2 <<= 2;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f16_bytes(v: f32) -> [u8; 2] {
        f16::from_f32(v).to_le_bytes()
    }

    #[test]
    fn test_f32_passthrough() {
        let values = [1.5f32, -2.25, 0.0, 100.0];
        let src: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let out = dequantize(GgmlDtype::F32, &src, 4).unwrap();
        assert_eq!(out, values);
    }

    #[test]
    fn test_f16_conversion() {
        let src: Vec<u8> = [1.0f32, -0.5].iter().flat_map(|v| f16_bytes(*v)).collect();
        let out = dequantize(GgmlDtype::F16, &src, 2).unwrap();
        assert_eq!(out, vec![1.0, -0.5]);
    }

    #[test]
    fn test_q4_0_block() {
        // One block, d = 2.0, all nibbles = 9 -> (9-8)*2.0 = 2.0
        let mut src = Vec::new();
        src.extend_from_slice(&f16_bytes(2.0));
        src.extend_from_slice(&[0x99u8; 16]);

        let out = dequantize(GgmlDtype::Q4_0, &src, 32).unwrap();
        assert_eq!(out.len(), 32);
        for v in out {
            assert!((v - 2.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_q8_0_block() {
        // d = 0.5, bytes alternate +4 / -4.
        let mut src = Vec::new();
        src.extend_from_slice(&f16_bytes(0.5));
        for i in 0..32 {
            src.push(if i % 2 == 0 { 4i8 as u8 } else { (-4i8) as u8 });
        }

        let out = dequantize(GgmlDtype::Q8_0, &src, 32).unwrap();
        assert_eq!(out[0], 2.0);
        assert_eq!(out[1], -2.0);
    }

    #[test]
    fn test_q5_0_high_bit() {
        // d = 1.0, qh all ones -> every q5 = nibble | 16; nibbles zero.
        let mut src = Vec::new();
        src.extend_from_slice(&f16_bytes(1.0));
        src.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        src.extend_from_slice(&[0u8; 16]);

        let out = dequantize(GgmlDtype::Q5_0, &src, 32).unwrap();
        // (16 - 16) * 1.0 = 0 everywhere
        assert!(out.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_q5_k_block() {
        // d = 1.0, dmin = 0: value = scale * q5. Scales all zero except the
        // packed 6-bit entries we set below; nibbles constant 3, no high bits.
        let mut src = Vec::new();
        src.extend_from_slice(&f16_bytes(1.0));
        src.extend_from_slice(&f16_bytes(0.0));
        let mut scales = [0u8; 12];
        scales[0] = 2; // sub-block 0 scale = 2
        scales[1] = 2; // sub-block 1 scale = 2
        src.extend_from_slice(&scales);
        src.extend_from_slice(&[0u8; 32]); // qh
        src.extend_from_slice(&[0x33u8; 128]); // qs: both nibbles = 3

        let out = dequantize(GgmlDtype::Q5K, &src, 256).unwrap();
        assert_eq!(out.len(), 256);
        // First 64 values come from sub-blocks 0 and 1: 2 * 3 = 6.
        for v in &out[..64] {
            assert_eq!(*v, 6.0);
        }
        // Later sub-blocks have zero scale.
        assert_eq!(out[128], 0.0);
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let err = dequantize(GgmlDtype::Q4_0, &[0u8; 10], 32).unwrap_err();
        assert!(matches!(err, KernelError::SizeMismatch { .. }));

        let err = dequantize(GgmlDtype::Q4_0, &[0u8; 18], 30).unwrap_err();
        assert!(matches!(err, KernelError::RaggedBlock { .. }));
    }
}
