//! 加密分帧模块
//!
//! 将归一化后的样本批次序列化、PKCS7填充、用AES-256-CBC加密，
//! 输出自描述的密文帧。
//!
//! # 帧格式
//! [IV (16字节)][密文 (padded_len字节)]
//!
//! 样本按 IEEE-754 binary32 小端序序列化，每个样本4字节。
//! 填充长度恒为 1..=16：输入已对齐时追加一整块填充。
//!
//! 密文没有附带认证标签（CBC无MAC），接收方无法检测篡改。

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes256Dec, Aes256Enc, Block};
use tracing::{debug, trace};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, TelemetryError};
use crate::keystore::SymmetricKey;
use crate::rng::{self, EntropySource};

/// AES分组长度
pub const BLOCK_LEN: usize = 16;

/// IV长度
pub const IV_LEN: usize = 16;

/// 每个样本的序列化字节数
pub const SAMPLE_LEN: usize = 4;

/// PKCS7填充字节数：余数为0时为一整块
pub fn padding_len(raw_len: usize) -> usize {
    BLOCK_LEN - raw_len % BLOCK_LEN
}

/// 填充后长度，恒为16的倍数且落在 (raw_len, raw_len + 16]
pub fn padded_len(raw_len: usize) -> usize {
    raw_len + padding_len(raw_len)
}

/// 每批独占的明文缓冲区
///
/// 按批次精确分配并逐字节写满，析构时清零。
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct PlaintextFrame {
    bytes: Vec<u8>,
}

impl PlaintextFrame {
    /// 序列化样本并追加PKCS7填充
    pub fn from_samples(samples: &[f32]) -> Self {
        let raw_len = samples.len() * SAMPLE_LEN;
        let pad = padding_len(raw_len);

        let mut bytes = Vec::with_capacity(raw_len + pad);
        for sample in samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        bytes.resize(raw_len + pad, pad as u8);

        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// 密文帧：IV + 密文
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherFrame {
    pub iv: [u8; IV_LEN],
    pub ciphertext: Vec<u8>,
}

impl CipherFrame {
    /// 帧总长度 = 16 + padded_len
    pub fn total_len(&self) -> usize {
        IV_LEN + self.ciphertext.len()
    }

    /// 拼接为 IV || 密文
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_len());
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.ciphertext);
        out
    }
}

/// 加密一批归一化样本
///
/// 每次调用抽取新的IV；IV抽取失败返回 `Rng`，加密引擎失败返回 `Cipher`，
/// 两者都只影响当前批次。
pub fn encrypt_batch(
    samples: &[f32],
    key: &SymmetricKey,
    entropy: &dyn EntropySource,
) -> Result<CipherFrame> {
    // 1. 序列化 + 填充
    let mut plaintext = PlaintextFrame::from_samples(samples);
    debug!(
        "明文帧: 原始{}字节, 填充{}字节, 共{}字节",
        samples.len() * SAMPLE_LEN,
        padding_len(samples.len() * SAMPLE_LEN),
        plaintext.len()
    );

    // 2. 新IV
    let iv = rng::random_array::<IV_LEN>(entropy, rng::IV_PERSONALIZATION)?;
    trace!("本批IV: {}", hex::encode(iv));

    // 3. 原地加密，缓冲区所有权转为密文
    cbc_encrypt_in_place(key.as_bytes(), &iv, &mut plaintext.bytes)?;
    let ciphertext = std::mem::take(&mut plaintext.bytes);

    Ok(CipherFrame { iv, ciphertext })
}

/// AES-256-CBC 原地加密（输入必须已按16字节对齐）
pub fn cbc_encrypt_in_place(key: &[u8], iv: &[u8; IV_LEN], buf: &mut [u8]) -> Result<()> {
    if buf.len() % BLOCK_LEN != 0 {
        return Err(TelemetryError::Cipher(format!(
            "缓冲区长度 {} 不是分组长度的整数倍",
            buf.len()
        )));
    }

    let cipher = Aes256Enc::new_from_slice(key)
        .map_err(|_| TelemetryError::Cipher(format!("密钥长度无效: {} 字节", key.len())))?;

    // 上一个密文块，首块使用IV
    let mut prev = *iv;
    for block in buf.chunks_exact_mut(BLOCK_LEN) {
        for (b, p) in block.iter_mut().zip(prev.iter()) {
            *b ^= p;
        }
        cipher.encrypt_block(Block::from_mut_slice(block));
        prev.copy_from_slice(block);
    }

    Ok(())
}

/// AES-256-CBC 原地解密
pub fn cbc_decrypt_in_place(key: &[u8], iv: &[u8; IV_LEN], buf: &mut [u8]) -> Result<()> {
    if buf.len() % BLOCK_LEN != 0 {
        return Err(TelemetryError::Cipher(format!(
            "密文长度 {} 不是分组长度的整数倍",
            buf.len()
        )));
    }

    let cipher = Aes256Dec::new_from_slice(key)
        .map_err(|_| TelemetryError::Cipher(format!("密钥长度无效: {} 字节", key.len())))?;

    let mut prev = *iv;
    let mut current = [0u8; BLOCK_LEN];
    for block in buf.chunks_exact_mut(BLOCK_LEN) {
        current.copy_from_slice(block);
        cipher.decrypt_block(Block::from_mut_slice(block));
        for (b, p) in block.iter_mut().zip(prev.iter()) {
            *b ^= p;
        }
        prev = current;
    }

    Ok(())
}

/// 解密密文帧，返回带填充的明文（诊断与测试用）
pub fn decrypt_frame(frame: &CipherFrame, key: &SymmetricKey) -> Result<Vec<u8>> {
    let mut buf = frame.ciphertext.clone();
    cbc_decrypt_in_place(key.as_bytes(), &frame.iv, &mut buf)?;
    Ok(buf)
}

/// 校验并去除PKCS7填充
pub fn strip_padding(padded: &[u8]) -> Result<&[u8]> {
    let invalid = || TelemetryError::Cipher("PKCS7填充无效".into());

    if padded.is_empty() || padded.len() % BLOCK_LEN != 0 {
        return Err(invalid());
    }
    let pad = *padded.last().ok_or_else(invalid)? as usize;
    if pad == 0 || pad > BLOCK_LEN {
        return Err(invalid());
    }

    let (body, tail) = padded.split_at(padded.len() - pad);
    if tail.iter().any(|&b| b as usize != pad) {
        return Err(invalid());
    }
    Ok(body)
}

/// 将小端序字节还原为样本
pub fn decode_samples(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % SAMPLE_LEN != 0 {
        return Err(TelemetryError::Cipher(format!(
            "样本字节数 {} 不是4的整数倍",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(SAMPLE_LEN)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct CountingEntropy(Cell<u8>);

    impl EntropySource for CountingEntropy {
        fn fill_entropy(&self, dest: &mut [u8]) -> Result<()> {
            let n = self.0.get();
            self.0.set(n.wrapping_add(1));
            dest.fill(n);
            Ok(())
        }
    }

    struct BrokenEntropy;

    impl EntropySource for BrokenEntropy {
        fn fill_entropy(&self, _dest: &mut [u8]) -> Result<()> {
            Err(TelemetryError::Rng("熵源不可用".into()))
        }
    }

    fn ramp(n: usize) -> Vec<f32> {
        (0..n).map(|i| i as f32 / (n as f32 - 1.0)).collect()
    }

    #[test]
    fn test_padding_rule_for_all_lengths() {
        for len in 0..512 {
            let pad = padding_len(len);
            let padded = padded_len(len);
            assert!((1..=16).contains(&pad));
            assert!(padded > len && padded <= len + 16);
            assert_eq!(padded % 16, 0);
            if len % 16 == 0 {
                assert_eq!(pad, 16, "对齐输入必须追加整块填充");
            }
        }
    }

    #[test]
    fn test_standard_batch_sizes() {
        // 187个样本 = 748字节
        assert_eq!(padding_len(748), 4);
        assert_eq!(padded_len(748), 752);
    }

    #[test]
    fn test_plaintext_frame_layout() {
        let frame = PlaintextFrame::from_samples(&[1.0, -2.5]);
        let bytes = frame.as_bytes();

        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[0..4], &1.0f32.to_le_bytes());
        assert_eq!(&bytes[4..8], &(-2.5f32).to_le_bytes());
        assert!(bytes[8..].iter().all(|&b| b == 8));
    }

    #[test]
    fn test_aligned_input_gets_full_padding_block() {
        let frame = PlaintextFrame::from_samples(&[0.25; 4]);
        assert_eq!(frame.len(), 32);
        assert!(frame.as_bytes()[16..].iter().all(|&b| b == 16));
    }

    #[test]
    fn test_nist_cbc_aes256_vector() {
        // NIST SP 800-38A F.2.5 前两个分组
        let key = hex::decode("603deb1015ca71be2b73aef0857d77811f352c073b6108d72d9810a30914dff4").unwrap();
        let iv: [u8; 16] = hex::decode("000102030405060708090a0b0c0d0e0f")
            .unwrap()
            .try_into()
            .unwrap();
        let mut buf = hex::decode("6bc1bee22e409f96e93d7e117393172aae2d8a571e03ac9c9eb76fac45af8e51").unwrap();

        cbc_encrypt_in_place(&key, &iv, &mut buf).unwrap();
        assert_eq!(
            hex::encode(&buf),
            "f58c4c04d6e5f1ba779eabfb5f7bfbd69cfc4e967edb808d679f777bc6702c7d"
        );

        cbc_decrypt_in_place(&key, &iv, &mut buf).unwrap();
        assert_eq!(
            hex::encode(&buf),
            "6bc1bee22e409f96e93d7e117393172aae2d8a571e03ac9c9eb76fac45af8e51"
        );
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = SymmetricKey::from_bytes([0x11; 32]);
        let samples = ramp(187);

        let frame = encrypt_batch(&samples, &key, &CountingEntropy(Cell::new(0))).unwrap();
        assert_eq!(frame.ciphertext.len(), 752);
        assert_eq!(frame.total_len(), 768);

        let padded = decrypt_frame(&frame, &key).unwrap();
        assert_eq!(padded, PlaintextFrame::from_samples(&samples).as_bytes());

        let body = strip_padding(&padded).unwrap();
        assert_eq!(decode_samples(body).unwrap(), samples);
    }

    #[test]
    fn test_fresh_iv_per_batch() {
        let key = SymmetricKey::from_bytes([0x22; 32]);
        let entropy = CountingEntropy(Cell::new(0));
        let samples = ramp(187);

        let a = encrypt_batch(&samples, &key, &entropy).unwrap();
        let b = encrypt_batch(&samples, &key, &entropy).unwrap();

        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_no_stale_bytes_between_batches() {
        let key = SymmetricKey::from_bytes([0x33; 32]);
        let entropy = CountingEntropy(Cell::new(0));

        let _long = encrypt_batch(&ramp(187), &key, &entropy).unwrap();
        let short = encrypt_batch(&[0.5, 0.75], &key, &entropy).unwrap();

        assert_eq!(short.ciphertext.len(), 16);
        let padded = decrypt_frame(&short, &key).unwrap();
        assert_eq!(padded, PlaintextFrame::from_samples(&[0.5, 0.75]).as_bytes());
    }

    #[test]
    fn test_to_bytes_prefixes_iv() {
        let frame = CipherFrame {
            iv: [7; 16],
            ciphertext: vec![1, 2, 3],
        };
        let bytes = frame.to_bytes();
        assert_eq!(&bytes[..16], &[7; 16]);
        assert_eq!(&bytes[16..], &[1, 2, 3]);
    }

    #[test]
    fn test_iv_failure_aborts_batch() {
        let key = SymmetricKey::from_bytes([0x44; 32]);
        let result = encrypt_batch(&ramp(187), &key, &BrokenEntropy);
        assert!(matches!(result, Err(TelemetryError::Rng(_))));
    }

    #[test]
    fn test_cipher_rejects_bad_inputs() {
        let iv = [0u8; 16];
        let mut unaligned = vec![0u8; 15];
        assert!(matches!(
            cbc_encrypt_in_place(&[0u8; 32], &iv, &mut unaligned),
            Err(TelemetryError::Cipher(_))
        ));

        let mut aligned = vec![0u8; 16];
        assert!(matches!(
            cbc_encrypt_in_place(&[0u8; 31], &iv, &mut aligned),
            Err(TelemetryError::Cipher(_))
        ));
    }

    #[test]
    fn test_strip_padding_rejects_garbage() {
        let mut bad = vec![0u8; 16];
        bad[15] = 3;
        assert!(strip_padding(&bad).is_err());
        assert!(strip_padding(&[0u8; 16]).is_err());
        assert!(strip_padding(&[]).is_err());
    }
}
