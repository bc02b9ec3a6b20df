//! 密钥存储模块
//!
//! 32字节对称密钥在首次启动时生成并持久化，之后每次启动从存储加载。
//! 存储句柄按作用域获取：打开命名空间、操作、随句柄析构关闭，
//! 不会跨越无关操作保持打开状态。

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::rc::Rc;

use tracing::{debug, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::{KEY_NAME, KEY_NAMESPACE};
use crate::error::{Result, TelemetryError};
use crate::rng::{self, EntropySource};

/// 对称密钥长度（AES-256）
pub const KEY_LEN: usize = 32;

/// AES-256 对称密钥，析构时清零
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_LEN]);

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey([REDACTED])")
    }
}

/// 加载结果
#[derive(Debug)]
pub enum KeyLookup {
    Found(SymmetricKey),
    NotFound,
}

/// 已打开的命名空间句柄，析构即关闭
pub trait Namespace {
    fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// 删除命名空间下所有条目
    fn clear(&mut self) -> Result<()>;

    fn put_bytes(&mut self, key: &str, value: &[u8]) -> Result<()>;
}

/// 持久化键值存储
pub trait KeyValueStore {
    /// 打开命名空间；只读句柄拒绝写操作
    fn open(&mut self, namespace: &str, read_only: bool) -> Result<Box<dyn Namespace + '_>>;
}

// ============ 内存存储 ============

#[derive(Default)]
struct MemoryState {
    namespaces: HashMap<String, HashMap<String, Vec<u8>>>,
    fail_reads: bool,
    fail_writes: bool,
}

/// 内存键值存储（用于测试）
/// 使用 Rc<RefCell<...>>，克隆体共享同一份数据，可模拟重启后重新打开
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Rc<RefCell<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 直接写入原始字节（模拟损坏条目）
    pub fn insert_raw(&self, namespace: &str, key: &str, value: &[u8]) {
        self.state
            .borrow_mut()
            .namespaces
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value.to_vec());
    }

    /// 读取原始字节
    pub fn raw(&self, namespace: &str, key: &str) -> Option<Vec<u8>> {
        self.state
            .borrow()
            .namespaces
            .get(namespace)
            .and_then(|ns| ns.get(key))
            .cloned()
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.state.borrow_mut().fail_reads = fail;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.state.borrow_mut().fail_writes = fail;
    }
}

struct MemoryNamespace {
    state: Rc<RefCell<MemoryState>>,
    namespace: String,
    read_only: bool,
}

impl MemoryNamespace {
    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(TelemetryError::Storage(format!("命名空间 {} 以只读方式打开", self.namespace)));
        }
        if self.state.borrow().fail_writes {
            return Err(TelemetryError::Storage("模拟写入失败".into()));
        }
        Ok(())
    }
}

impl Namespace for MemoryNamespace {
    fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let state = self.state.borrow();
        if state.fail_reads {
            return Err(TelemetryError::Storage("模拟读取失败".into()));
        }
        Ok(state
            .namespaces
            .get(&self.namespace)
            .and_then(|ns| ns.get(key))
            .cloned())
    }

    fn clear(&mut self) -> Result<()> {
        self.check_writable()?;
        self.state.borrow_mut().namespaces.remove(&self.namespace);
        Ok(())
    }

    fn put_bytes(&mut self, key: &str, value: &[u8]) -> Result<()> {
        self.check_writable()?;
        self.state
            .borrow_mut()
            .namespaces
            .entry(self.namespace.clone())
            .or_default()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

impl KeyValueStore for MemoryStore {
    fn open(&mut self, namespace: &str, read_only: bool) -> Result<Box<dyn Namespace + '_>> {
        Ok(Box::new(MemoryNamespace {
            state: Rc::clone(&self.state),
            namespace: namespace.to_string(),
            read_only,
        }))
    }
}

// ============ 文件存储 ============

/// 目录型键值存储：每个命名空间一个子目录，每个键一个文件
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

fn check_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\']);
    if valid {
        Ok(())
    } else {
        Err(TelemetryError::Storage(format!("非法的存储名称: {:?}", name)))
    }
}

struct FileNamespace {
    dir: PathBuf,
    read_only: bool,
}

impl FileNamespace {
    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(TelemetryError::Storage(format!(
                "命名空间 {} 以只读方式打开",
                self.dir.display()
            )));
        }
        Ok(())
    }
}

impl Namespace for FileNamespace {
    fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        check_name(key)?;
        match fs::read(self.dir.join(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(TelemetryError::Storage(format!("读取 {} 失败: {}", key, e))),
        }
    }

    fn clear(&mut self) -> Result<()> {
        self.check_writable()?;
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(TelemetryError::Storage(format!("清空命名空间失败: {}", e))),
        }
        fs::create_dir_all(&self.dir)
            .map_err(|e| TelemetryError::Storage(format!("创建命名空间失败: {}", e)))
    }

    fn put_bytes(&mut self, key: &str, value: &[u8]) -> Result<()> {
        self.check_writable()?;
        check_name(key)?;
        fs::create_dir_all(&self.dir)
            .map_err(|e| TelemetryError::Storage(format!("创建命名空间失败: {}", e)))?;
        fs::write(self.dir.join(key), value)
            .map_err(|e| TelemetryError::Storage(format!("写入 {} 失败: {}", key, e)))
    }
}

impl KeyValueStore for FileStore {
    fn open(&mut self, namespace: &str, read_only: bool) -> Result<Box<dyn Namespace + '_>> {
        check_name(namespace)?;
        Ok(Box::new(FileNamespace {
            dir: self.root.join(namespace),
            read_only,
        }))
    }
}

// ============ 密钥存储 ============

/// 密钥生命周期管理：加载、生成、持久化
pub struct KeyStore<S: KeyValueStore> {
    store: S,
    namespace: String,
    key_name: String,
}

impl<S: KeyValueStore> KeyStore<S> {
    /// 使用默认命名空间 `encryption_key` / 键名 `key`
    pub fn new(store: S) -> Self {
        Self::with_location(store, KEY_NAMESPACE, KEY_NAME)
    }

    pub fn with_location(store: S, namespace: &str, key_name: &str) -> Self {
        Self {
            store,
            namespace: namespace.to_string(),
            key_name: key_name.to_string(),
        }
    }

    /// 读取持久化密钥
    ///
    /// 长度不为32的条目或读取错误都记录日志并视为不存在，不会向上传播。
    pub fn load(&mut self) -> KeyLookup {
        let stored = match self.store.open(&self.namespace, true) {
            Ok(ns) => ns.get_bytes(&self.key_name),
            Err(e) => Err(e),
        };

        match stored {
            Ok(Some(mut bytes)) => {
                let lookup = match <[u8; KEY_LEN]>::try_from(bytes.as_slice()) {
                    Ok(key) => KeyLookup::Found(SymmetricKey::from_bytes(key)),
                    Err(_) => {
                        warn!(
                            "存储的密钥长度异常: {} 字节（期望 {}），视为不存在",
                            bytes.len(),
                            KEY_LEN
                        );
                        KeyLookup::NotFound
                    }
                };
                bytes.zeroize();
                lookup
            }
            Ok(None) => {
                debug!("命名空间 {} 中没有密钥", self.namespace);
                KeyLookup::NotFound
            }
            Err(e) => {
                warn!("读取密钥失败: {}，视为不存在", e);
                KeyLookup::NotFound
            }
        }
    }

    /// 从播种后的 DRBG 抽取新密钥
    pub fn generate(entropy: &dyn EntropySource) -> Result<SymmetricKey> {
        let bytes = rng::random_array::<KEY_LEN>(entropy, rng::KEY_PERSONALIZATION)?;
        Ok(SymmetricKey::from_bytes(bytes))
    }

    /// 清空命名空间后写入密钥
    ///
    /// 注意：先清空再写入不是原子操作，写入过程中掉电会留下空的或损坏的条目，
    /// 下次启动时 `load` 会将其视为不存在并重新生成密钥。
    pub fn store(&mut self, key: &SymmetricKey) -> Result<()> {
        let mut ns = self.store.open(&self.namespace, false)?;
        ns.clear()?;
        ns.put_bytes(&self.key_name, key.as_bytes())
    }

    /// 引导：加载已有密钥，否则生成并持久化
    ///
    /// 生成或持久化失败时返回错误，调用方不得继续进入采样阶段。
    pub fn bootstrap(&mut self, entropy: &dyn EntropySource) -> Result<SymmetricKey> {
        if let KeyLookup::Found(key) = self.load() {
            info!("已从存储加载加密密钥");
            return Ok(key);
        }

        info!("未找到可用密钥，正在生成新密钥");
        let key = Self::generate(entropy)?;
        self.store(&key)?;
        info!("新密钥已生成并持久化");
        Ok(key)
    }
}
