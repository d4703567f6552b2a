use alloc::boxed::Box;

pub use usb_if::err::TransferError;
pub use usb_if::host::USBError;

pub type Result<T = ()> = core::result::Result<T, HubError>;

/// 寄存器总线访问失败
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("register access failed at offset {offset:#x}")]
pub struct RegError {
    pub offset: usize,
}

/// Root Hub 操作错误
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubError {
    /// 端口号越界或不支持的特性/选择子
    #[error("Invalid argument")]
    InvalidArgument,
    /// 当前端口状态不允许该操作
    #[error("Operation not valid in current port state")]
    InvalidState,
    #[error("Port {0} reset timeout")]
    ResetTimeout(u8),
    #[error("Port {0} resume timeout")]
    ResumeTimeout(u8),
    /// 有端口正在恢复，不能挂起总线
    #[error("Root hub busy")]
    Busy,
    #[error("Controller not accessible")]
    Shutdown,
    #[error(transparent)]
    Io(#[from] RegError),
}

impl HubError {
    /// 协议层 stall：上层不应重试同一请求
    pub fn is_stall(&self) -> bool {
        matches!(self, HubError::InvalidArgument | HubError::InvalidState)
    }
}

impl From<HubError> for USBError {
    fn from(value: HubError) -> Self {
        match value {
            HubError::InvalidArgument | HubError::InvalidState => {
                USBError::TransferError(TransferError::Stall)
            }
            HubError::ResetTimeout(_) | HubError::ResumeTimeout(_) => USBError::Timeout,
            HubError::Busy => USBError::Busy,
            HubError::Shutdown => USBError::NotInitialized,
            HubError::Io(e) => USBError::Other(Box::new(e)),
        }
    }
}
