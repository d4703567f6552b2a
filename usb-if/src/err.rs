use alloc::string::String;

/// 控制传输层面的错误
///
/// Root Hub 没有真实的总线事务，所有请求错误最终都以 `Stall` 形式报告给上层。
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("Stall")]
    Stall,
    #[error("Request queue full")]
    RequestQueueFull,
    #[error("Timeout")]
    Timeout,
    #[error("Cancelled")]
    Cancelled,
    #[error("Other error: {0}")]
    Other(String),
}
