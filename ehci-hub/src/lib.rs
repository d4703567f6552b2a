//! EHCI Root Hub
//!
//! 把 EHCI 控制器的 PORTSC 寄存器组抽象为一个 USB 2.0 Hub：
//! 上层 Hub 驱动发来的类请求在这里翻译成寄存器操作，
//! 复位/恢复这类需要等待的动作由截止时间驱动，在状态查询或定时器回调里收尾。

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate log;

pub mod config;
pub mod err;
pub mod hub;
pub mod osal;
pub mod port;
pub mod reg;

#[cfg(test)]
mod mock;

pub use config::EhciConfig;
pub use err::{HubError, RegError, Result};
pub use hub::{
    EhciRootHub, Event, HandoffOutcome, RhState, StatusChange,
    event::{HubEvent, HubEventHandler},
};
pub use osal::Kernel;
pub use port::PortState;
pub use reg::{EhciRegisters, HcsParams, MmioRegisters, PortSc, UsbCmd, UsbSts};

pub use usb_if::host::hub::{
    HubDescriptor, HubFeature, HubRequest, PortFeature, PortStatus, PortStatusWord,
};
