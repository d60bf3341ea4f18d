//! デバイストークンのプール
//!
//! 物理デバイス ID をトークンとして有界チャネルに詰めておき、フォールドの
//! 実行前に1つ取り出す。取り出したトークンは `DeviceLease` が保持し、
//! エラーやパニックで抜けた場合も `Drop` でプールへ返す。
//! 流通しているトークン数（キュー内 + 貸出中）は常にデバイス数と等しい。

use std::collections::HashSet;
use std::fmt;

use crossbeam_channel as chan;
use serde::{Deserialize, Serialize};

use crate::error::ResourceError;

/// デバイス ID
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gpu{}", self.0)
    }
}

/// デバイストークンのプール（MPMC）
pub struct DevicePool {
    tx: chan::Sender<DeviceId>,
    rx: chan::Receiver<DeviceId>,
    capacity: usize,
}

impl DevicePool {
    /// 全トークンを投入した状態でプールを作る
    pub fn new(devices: &[DeviceId]) -> Result<Self, ResourceError> {
        if devices.is_empty() {
            return Err(ResourceError::NoDevices);
        }
        let mut seen = HashSet::new();
        for &d in devices {
            if !seen.insert(d) {
                return Err(ResourceError::DuplicateDevice(d));
            }
        }

        let (tx, rx) = chan::bounded(devices.len());
        for &d in devices {
            // 容量 = デバイス数なので満杯にはならない
            let _ = tx.try_send(d);
        }
        Ok(Self {
            tx,
            rx,
            capacity: devices.len(),
        })
    }

    /// 登録デバイス数
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 現在キューに残っているトークン数
    pub fn available(&self) -> usize {
        self.rx.len()
    }

    /// トークンを取得する（空きが出るまでブロック）
    pub fn acquire(&self) -> DeviceLease<'_> {
        // プール自身が Sender を保持しているため切断されない
        let device = match self.rx.recv() {
            Ok(d) => d,
            Err(_) => unreachable!("device pool owns its sender"),
        };
        log::debug!("acquired {device} ({} left)", self.available());
        DeviceLease { pool: self, device }
    }

    /// 空きがあれば取得する
    pub fn try_acquire(&self) -> Option<DeviceLease<'_>> {
        self.rx.try_recv().ok().map(|device| DeviceLease { pool: self, device })
    }

    /// トークンを保持したままクロージャを実行し、どの経路で抜けても返却する
    pub fn with_device<T>(&self, f: impl FnOnce(DeviceId) -> T) -> T {
        let lease = self.acquire();
        f(lease.device())
    }

    fn release(&self, device: DeviceId) {
        if let Err(e) = self.tx.try_send(device) {
            // トークンの重複返却。会計が壊れている
            log::error!("device pool over capacity while releasing {}", e.into_inner());
            debug_assert!(false, "device token returned twice");
        } else {
            log::debug!("released {device}");
        }
    }
}

/// 貸出中のデバイストークン
#[must_use = "dropping the lease returns the device immediately"]
pub struct DeviceLease<'a> {
    pool: &'a DevicePool,
    device: DeviceId,
}

impl DeviceLease<'_> {
    pub fn device(&self) -> DeviceId {
        self.device
    }
}

impl Drop for DeviceLease<'_> {
    fn drop(&mut self) {
        self.pool.release(self.device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{AssertUnwindSafe, catch_unwind};

    fn ids(n: u32) -> Vec<DeviceId> {
        (0..n).map(DeviceId).collect()
    }

    #[test]
    fn test_acquire_release_roundtrip() {
        let pool = DevicePool::new(&ids(2)).unwrap();
        let a = pool.acquire();
        let b = pool.acquire();
        assert_ne!(a.device(), b.device());
        assert_eq!(pool.available(), 0);
        assert!(pool.try_acquire().is_none());
        drop(a);
        assert_eq!(pool.available(), 1);
        drop(b);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_token_returned_on_panic() {
        let pool = DevicePool::new(&ids(1)).unwrap();
        let result = catch_unwind(AssertUnwindSafe(|| {
            pool.with_device(|_| panic!("fold crashed"));
        }));
        assert!(result.is_err());
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_rejects_empty_and_duplicates() {
        assert_eq!(DevicePool::new(&[]).err(), Some(ResourceError::NoDevices));
        assert_eq!(
            DevicePool::new(&[DeviceId(0), DeviceId(0)]).err(),
            Some(ResourceError::DuplicateDevice(DeviceId(0)))
        );
    }
}
