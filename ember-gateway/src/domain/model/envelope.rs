//! 通知信封
//!
//! 一次扇出只编码一次通知，所有投递尝试共享同一份不可变字节。
//! 生命周期由显式引用计数管理：
//! - 每次安排投递尝试前克隆句柄（计数 +1）
//! - 尝试结束（成功或失败）时句柄随之释放（计数 -1）
//! - 计数归零时释放回调恰好触发一次，之后字节不再可达

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering, fence};

use bytes::Bytes;

/// 计数归零时的释放回调
///
/// 保证恰好调用一次；测试用插桩实现验证引用安全（P2）
pub trait ReleaseHook: Send + Sync {
    fn on_release(&self);
}

struct EnvelopeInner {
    payload: Bytes,
    refs: AtomicUsize,
    hook: Option<Arc<dyn ReleaseHook>>,
}

/// 通知信封句柄
///
/// Clone 即登记一次投递尝试，Drop 即该尝试完成。
/// 释放动作绑定在 Drop 上，任何提前返回或失败路径都无法跳过
pub struct NotificationEnvelope {
    inner: Arc<EnvelopeInner>,
}

impl NotificationEnvelope {
    /// 以初始计数 1 包装一份编码好的通知
    pub fn new(payload: Bytes) -> Self {
        Self::build(payload, None)
    }

    /// 附带释放回调的构造（测试与诊断用）
    pub fn with_release_hook(payload: Bytes, hook: Arc<dyn ReleaseHook>) -> Self {
        Self::build(payload, Some(hook))
    }

    fn build(payload: Bytes, hook: Option<Arc<dyn ReleaseHook>>) -> Self {
        Self {
            inner: Arc::new(EnvelopeInner {
                payload,
                refs: AtomicUsize::new(1),
                hook,
            }),
        }
    }

    /// 共享底层字节（廉价克隆，不复制内容）
    pub fn payload(&self) -> Bytes {
        self.inner.payload.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.payload.is_empty()
    }

    /// 当前引用计数（诊断用）
    pub fn ref_count(&self) -> usize {
        self.inner.refs.load(Ordering::Acquire)
    }
}

impl Clone for NotificationEnvelope {
    fn clone(&self) -> Self {
        self.inner.refs.fetch_add(1, Ordering::Relaxed);
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Drop for NotificationEnvelope {
    fn drop(&mut self) {
        if self.inner.refs.fetch_sub(1, Ordering::Release) == 1 {
            fence(Ordering::Acquire);
            if let Some(hook) = &self.inner.hook {
                hook.on_release();
            }
        }
    }
}

impl std::fmt::Debug for NotificationEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationEnvelope")
            .field("len", &self.len())
            .field("refs", &self.ref_count())
            .finish()
    }
}
