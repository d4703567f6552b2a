use alloc::boxed::Box;

use crate::err::TransferError;

pub mod hub;

#[derive(thiserror::Error, Debug)]
pub enum USBError {
    #[error("Timeout")]
    Timeout,
    #[error("No memory available")]
    NoMemory,
    #[error("Transfer error: {0}")]
    TransferError(#[from] TransferError),
    #[error("Not initialized")]
    NotInitialized,
    #[error("Not found")]
    NotFound,
    #[error("Resource busy")]
    Busy,
    #[error("Other error: {0}")]
    Other(#[from] Box<dyn core::error::Error + Send + Sync>),
}

impl USBError {
    /// 是否为协议层 stall（请求参数或状态非法）
    pub fn is_stall(&self) -> bool {
        matches!(self, USBError::TransferError(TransferError::Stall))
    }
}
