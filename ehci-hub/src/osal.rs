use core::time::Duration;

use crate::err::Result;

/// 驱动所需的内核服务
pub trait Kernel: Send + Sync + 'static {
    /// 单调时钟，自任意起点起算
    fn now(&self) -> Duration;

    /// 阻塞当前执行流 `duration`。调用方保证此时不持有控制器锁。
    fn delay(&self, duration: Duration);
}

/// 时间点 `now` 是否已到达 `deadline`
#[inline]
pub fn time_after_eq(now: Duration, deadline: Duration) -> bool {
    now >= deadline
}

/// 有界轮询：每隔 `interval` 调用一次 `done`，最多 `polls` 次。
///
/// 返回 `Ok(true)` 表示条件满足，`Ok(false)` 表示超时；寄存器错误直接向上传播。
pub fn handshake<F>(kernel: &dyn Kernel, polls: u32, interval: Duration, mut done: F) -> Result<bool>
where
    F: FnMut() -> Result<bool>,
{
    for _ in 0..polls {
        if done()? {
            return Ok(true);
        }
        kernel.delay(interval);
    }
    done()
}
