//! 随机数模块
//!
//! 熵源 + 个性化串播种的 HMAC-DRBG（SHA-256）。
//! DRBG 上下文按操作创建、使用、销毁，批次之间不残留任何状态。
//!
//! 状态更新流程:
//! K = HMAC(K, V || 0x00 || data), V = HMAC(K, V)
//! 若 data 非空: K = HMAC(K, V || 0x01 || data), V = HMAC(K, V)

use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, TelemetryError};

/// 密钥生成用的个性化串
pub const KEY_PERSONALIZATION: &[u8] = b"ecg-link/key";

/// IV 生成用的个性化串
pub const IV_PERSONALIZATION: &[u8] = b"ecg-link/iv";

/// 会话ID用的个性化串
pub const SESSION_PERSONALIZATION: &[u8] = b"ecg-link/session";

/// 播种材料长度：32字节熵 + 16字节 nonce
const SEED_LEN: usize = 48;

/// 单次请求最大字节数
const MAX_REQUEST_LEN: usize = 65536;

/// 需要重新播种前允许的请求数
const RESEED_INTERVAL: u64 = 10_000;

const OUT_LEN: usize = 32;

const SEP_ZERO: &[u8] = &[0x00];
const SEP_ONE: &[u8] = &[0x01];

/// 熵源
pub trait EntropySource {
    /// 用熵填满 `dest`，失败时返回 [`TelemetryError::Rng`]
    fn fill_entropy(&self, dest: &mut [u8]) -> Result<()>;
}

/// 操作系统熵源
pub struct SystemEntropy {
    rng: SystemRandom,
}

impl SystemEntropy {
    pub fn new() -> Self {
        Self {
            rng: SystemRandom::new(),
        }
    }
}

impl Default for SystemEntropy {
    fn default() -> Self {
        Self::new()
    }
}

impl EntropySource for SystemEntropy {
    fn fill_entropy(&self, dest: &mut [u8]) -> Result<()> {
        self.rng
            .fill(dest)
            .map_err(|_| TelemetryError::Rng("系统熵源读取失败".into()))
    }
}

/// HMAC-DRBG 实例
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Drbg {
    k: [u8; OUT_LEN],
    v: [u8; OUT_LEN],
    requests: u64,
}

impl Drbg {
    /// 从熵源与个性化串播种
    pub fn seeded(entropy: &dyn EntropySource, personalization: &[u8]) -> Result<Self> {
        let mut seed = [0u8; SEED_LEN];
        entropy.fill_entropy(&mut seed)?;

        let mut drbg = Self {
            k: [0x00; OUT_LEN],
            v: [0x01; OUT_LEN],
            requests: 0,
        };
        drbg.update(&[&seed[..], personalization]);
        seed.zeroize();

        Ok(drbg)
    }

    /// 生成随机字节
    pub fn fill(&mut self, out: &mut [u8]) -> Result<()> {
        if out.len() > MAX_REQUEST_LEN {
            return Err(TelemetryError::Rng(format!(
                "单次请求 {} 字节超出上限 {}",
                out.len(),
                MAX_REQUEST_LEN
            )));
        }
        if self.requests >= RESEED_INTERVAL {
            return Err(TelemetryError::Rng("DRBG 需要重新播种".into()));
        }

        for block in out.chunks_mut(OUT_LEN) {
            self.v = hmac_parts(&self.k, &[&self.v[..]]);
            block.copy_from_slice(&self.v[..block.len()]);
        }
        self.update(&[]);
        self.requests += 1;

        Ok(())
    }

    fn update(&mut self, provided: &[&[u8]]) {
        let has_data = provided.iter().any(|part| !part.is_empty());

        let mut parts: Vec<&[u8]> = vec![&self.v[..], SEP_ZERO];
        parts.extend_from_slice(provided);
        let k = hmac_parts(&self.k, &parts);
        self.k = k;
        self.v = hmac_parts(&self.k, &[&self.v[..]]);

        if has_data {
            let mut parts: Vec<&[u8]> = vec![&self.v[..], SEP_ONE];
            parts.extend_from_slice(provided);
            let k = hmac_parts(&self.k, &parts);
            self.k = k;
            self.v = hmac_parts(&self.k, &[&self.v[..]]);
        }
    }
}

fn hmac_parts(key: &[u8; OUT_LEN], parts: &[&[u8]]) -> [u8; OUT_LEN] {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    let mut context = hmac::Context::with_key(&key);
    for part in parts {
        context.update(part);
    }

    let tag = context.sign();
    let mut out = [0u8; OUT_LEN];
    out.copy_from_slice(tag.as_ref());
    out
}

/// 一次性抽取 N 个随机字节：播种、生成、销毁
pub fn random_array<const N: usize>(
    entropy: &dyn EntropySource,
    personalization: &[u8],
) -> Result<[u8; N]> {
    let mut drbg = Drbg::seeded(entropy, personalization)?;
    let mut out = [0u8; N];
    drbg.fill(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    /// 每次调用返回不同内容的确定性熵源
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

    /// 原样返回固定播种材料
    struct FixedEntropy(Vec<u8>);

    impl EntropySource for FixedEntropy {
        fn fill_entropy(&self, dest: &mut [u8]) -> Result<()> {
            dest.copy_from_slice(&self.0);
            Ok(())
        }
    }

    #[test]
    fn test_nist_hmac_drbg_sha256_vector() {
        // CAVP HMAC_DRBG.rsp [SHA-256] 无预测抗性, COUNT = 0
        let entropy_input = "ca851911349384bffe89de1cbdc46e6831e44d34a4fb935ee285dd14b71a7488";
        let nonce = "659ba96c601dc69fc902940805ec0ca8";
        let expected = hex::decode(concat!(
            "e528e9abf2dece54d47c7e75e5fe302149f817ea9fb4bee6f4199697d04d5b89",
            "d54fbb978a15b5c443c9ec21036d2460b6f73ebad0dc2aba6e624abf07745bc1",
            "07694bb7547bb0995f70de25d6b29e2d3011bb19d27676c07162c8b5ccde0668",
            "961df86803482cb37ed6d5c0bb8d50cf1f50d476aa0458bdaba806f48be9dcb8",
        ))
        .unwrap();

        let seed = hex::decode(format!("{entropy_input}{nonce}")).unwrap();
        assert_eq!(seed.len(), SEED_LEN);

        let mut drbg = Drbg::seeded(&FixedEntropy(seed), b"").unwrap();
        let mut out = [0u8; 128];
        drbg.fill(&mut out).unwrap();
        drbg.fill(&mut out).unwrap();
        assert_eq!(out.to_vec(), expected);
    }

    #[test]
    fn test_same_seed_same_output() {
        let a: [u8; 32] = random_array(&CountingEntropy(Cell::new(7)), KEY_PERSONALIZATION).unwrap();
        let b: [u8; 32] = random_array(&CountingEntropy(Cell::new(7)), KEY_PERSONALIZATION).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_personalization_separates_streams() {
        let a: [u8; 16] = random_array(&CountingEntropy(Cell::new(1)), KEY_PERSONALIZATION).unwrap();
        let b: [u8; 16] = random_array(&CountingEntropy(Cell::new(1)), IV_PERSONALIZATION).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_successive_draws_differ() {
        let mut drbg = Drbg::seeded(&CountingEntropy(Cell::new(0)), IV_PERSONALIZATION).unwrap();
        let mut first = [0u8; 48];
        let mut second = [0u8; 48];
        drbg.fill(&mut first).unwrap();
        drbg.fill(&mut second).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_entropy_failure_is_rng_error() {
        let result: Result<[u8; 16]> = random_array(&BrokenEntropy, IV_PERSONALIZATION);
        assert!(matches!(result, Err(TelemetryError::Rng(_))));
    }

    #[test]
    fn test_oversized_request_rejected() {
        let mut drbg = Drbg::seeded(&CountingEntropy(Cell::new(0)), IV_PERSONALIZATION).unwrap();
        let mut big = vec![0u8; MAX_REQUEST_LEN + 1];
        assert!(drbg.fill(&mut big).is_err());
    }

    #[test]
    fn test_system_entropy_fills() {
        let mut buf = [0u8; 32];
        SystemEntropy::new().fill_entropy(&mut buf).unwrap();
        assert_ne!(buf, [0u8; 32]);
    }
}
