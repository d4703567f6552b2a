//! Root Hub 端口
//!
//! 每个端口的逻辑状态由 PORTSC 和少量软件标志共同决定。
//! 复位和恢复信号需要持续一段时间，这里只登记截止时间，
//! 真正结束信号的动作在 [`Port::finalize_if_due`] 中完成。

use alloc::sync::Arc;
use core::time::Duration;

use usb_if::host::hub::{DeviceSpeed, PortChangeBits, PortStatusBits, PortStatusWord};

use crate::{
    config::EhciConfig,
    err::{HubError, Result},
    osal::{Kernel, handshake, time_after_eq},
    reg::{EhciRegisters, HcsParams, PortSc},
};

/// 恢复信号持续时间（USB 2.0 7.1.7.7）
pub const RESUME_SIGNAL: Duration = Duration::from_millis(20);
/// 根端口复位信号持续时间（USB 2.0 7.1.7.5）
pub const RESET_SIGNAL: Duration = Duration::from_millis(50);

const HANDSHAKE_INTERVAL: Duration = Duration::from_micros(1);
const RESET_HANDSHAKE_POLLS: u32 = 1000;
const RESUME_HANDSHAKE_POLLS: u32 = 2000;

/// 端口操作共享的环境：时钟、策略和硬件参数
pub(crate) struct HubEnv {
    pub kernel: Arc<dyn Kernel>,
    pub config: EhciConfig,
    pub params: HcsParams,
}

impl HubEnv {
    pub fn now(&self) -> Duration {
        self.kernel.now()
    }

    pub fn kernel(&self) -> &dyn Kernel {
        self.kernel.as_ref()
    }
}

/// 端口逻辑状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    PoweredOff,
    Disconnected,
    Connected,
    Enabled,
    /// 软件已请求挂起，硬件尚未进入挂起
    Suspending,
    Suspended,
    Resuming,
    Resetting,
    /// 端口已交给 companion 控制器
    OwnedByCompanion,
}

/// 单个端口的软件状态
#[derive(Debug, Clone, Default)]
pub struct Port {
    /// 0-based
    index: usize,
    pub(crate) owned_by_companion: bool,
    pub(crate) suspended: bool,
    /// 正在发出恢复信号（主机发起或远程唤醒）
    pub(crate) resuming: bool,
    /// 复位或恢复信号的结束时间，同一时刻最多一个
    pub(crate) reset_deadline: Option<Duration>,
    pub(crate) change_suspend: bool,
    /// 复位完成，直到 ClearPortFeature(C_PORT_RESET) 才清除
    pub(crate) change_reset: bool,
}

impl Port {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            ..Default::default()
        }
    }

    /// 1-based 端口号
    pub fn id(&self) -> u8 {
        self.index as u8 + 1
    }

    /// 最近一次读到的归属
    pub fn owned_by_companion(&self) -> bool {
        self.owned_by_companion
    }

    pub fn state(&self, sc: PortSc) -> PortState {
        if !sc.contains(PortSc::POWER) {
            return PortState::PoweredOff;
        }
        if sc.contains(PortSc::OWNER) {
            return PortState::OwnedByCompanion;
        }
        if sc.contains(PortSc::RESET) || (self.reset_deadline.is_some() && !self.resuming) {
            return PortState::Resetting;
        }
        if sc.contains(PortSc::RESUME) || self.resuming {
            return PortState::Resuming;
        }
        if !sc.contains(PortSc::CONNECT) {
            return PortState::Disconnected;
        }
        if sc.contains(PortSc::SUSPEND) {
            return PortState::Suspended;
        }
        if self.suspended {
            return PortState::Suspending;
        }
        if sc.contains(PortSc::PE) {
            PortState::Enabled
        } else {
            PortState::Connected
        }
    }

    /// 截止时间已到（或已过）
    pub fn deadline_elapsed(&self, now: Duration) -> bool {
        self.reset_deadline
            .is_some_and(|deadline| time_after_eq(now, deadline))
    }

    /// 还没报告给上层的变化
    pub fn change_bits(&self, sc: PortSc, config: &EhciConfig) -> PortChangeBits {
        let mut change = PortChangeBits::empty();
        if sc.contains(PortSc::CSC) {
            change |= PortChangeBits::C_CONNECTION;
        }
        if sc.contains(PortSc::PEC) {
            change |= PortChangeBits::C_ENABLE;
        }
        if sc.contains(PortSc::OCC) && !config.ignore_oc {
            change |= PortChangeBits::C_OVER_CURRENT;
        }
        if self.change_suspend {
            change |= PortChangeBits::C_SUSPEND;
        }
        if self.change_reset {
            change |= PortChangeBits::C_RESET;
        }
        change
    }

    /// 是否需要在状态位图中置位
    pub fn has_pending_change(&self, sc: PortSc, config: &EhciConfig, now: Duration) -> bool {
        !self.change_bits(sc, config).is_empty() || self.deadline_elapsed(now)
    }

    /// SetPortFeature(PORT_SUSPEND)
    pub(crate) fn suspend<R: EhciRegisters>(&mut self, regs: &mut R, env: &HubEnv) -> Result {
        if env.config.no_selective_suspend {
            return Ok(());
        }

        let sc = regs.read_port(self.index)?;
        if !sc.contains(PortSc::PE) || sc.contains(PortSc::RESET) || self.resuming {
            debug!("port {} suspend refused: {:#010x}", self.id(), sc.bits());
            return Err(HubError::InvalidState);
        }

        let mut value = sc.for_write().difference(PortSc::WAKE) | PortSc::SUSPEND;
        if env.config.remote_wakeup {
            value |= sc.wake_bits_for_connect();
        }
        regs.write_port(self.index, value)?;
        self.suspended = true;
        debug!("port {} suspended", self.id());
        Ok(())
    }

    /// ClearPortFeature(PORT_SUSPEND)：开始发恢复信号
    pub(crate) fn resume<R: EhciRegisters>(&mut self, regs: &mut R, env: &HubEnv) -> Result {
        let sc = regs.read_port(self.index)?;
        if sc.contains(PortSc::RESET) {
            return Err(HubError::InvalidState);
        }
        if env.config.no_selective_suspend || !sc.contains(PortSc::SUSPEND) {
            return Ok(());
        }
        if !sc.contains(PortSc::PE) {
            return Err(HubError::InvalidState);
        }

        let value = sc.for_write().difference(PortSc::WAKE) | PortSc::RESUME;
        regs.write_port(self.index, value)?;
        self.reset_deadline = Some(env.now() + RESUME_SIGNAL);
        self.resuming = true;
        debug!("port {} resume signaling", self.id());
        Ok(())
    }

    /// SetPortFeature(PORT_RESET)
    ///
    /// 未使能、线路为 K 状态的低速设备不复位，直接交给 companion。
    pub(crate) fn reset<R: EhciRegisters>(&mut self, regs: &mut R, env: &HubEnv) -> Result {
        let sc = regs.read_port(self.index)?;
        if sc.contains(PortSc::RESUME) || self.resuming {
            return Err(HubError::InvalidState);
        }
        if !sc.contains(PortSc::CONNECT) {
            debug!("port {} reset ignored, nothing connected", self.id());
            return Ok(());
        }

        let mut value = sc.for_write();
        if !sc.contains(PortSc::PE) && !env.config.integrated_tt && sc.is_low_speed_line() {
            debug!("port {} low speed --> companion", self.id());
            value |= PortSc::OWNER;
            self.owned_by_companion = true;
        } else {
            debug!("port {} reset", self.id());
            value |= PortSc::RESET;
            value.remove(PortSc::PE);
            // 复位会结束挂起，按一次挂起变化上报
            if self.suspended {
                self.suspended = false;
                self.change_suspend = true;
            }
            self.reset_deadline = Some(env.now() + RESET_SIGNAL);
        }
        regs.write_port(self.index, value)?;
        Ok(())
    }

    /// 到期的复位/恢复信号在这里结束，返回最新的 PORTSC。
    ///
    /// 硬件在握手时限内没有清掉信号位时，软件状态仍然收尾，再返回超时错误。
    pub(crate) fn finalize_if_due<R: EhciRegisters>(
        &mut self,
        regs: &mut R,
        env: &HubEnv,
        mut sc: PortSc,
    ) -> Result<PortSc> {
        let index = self.index;
        let now = env.now();

        if sc.contains(PortSc::RESUME) {
            match self.reset_deadline {
                None => {
                    // 设备发起的远程唤醒。恢复握手超时后残留的 RESUME 也走这里，
                    // 重新计时，到期后再报一次 C_SUSPEND。
                    debug!("port {} remote wakeup", self.id());
                    self.reset_deadline = Some(now + RESUME_SIGNAL);
                    self.resuming = true;
                }
                Some(deadline) if time_after_eq(now, deadline) => {
                    self.suspended = false;
                    self.change_suspend = true;
                    self.resuming = false;
                    self.reset_deadline = None;

                    let cur = regs.read_port(index)?;
                    regs.write_port(index, cur.for_write().difference(PortSc::RESUME))?;
                    let done = handshake(
                        env.kernel(),
                        RESUME_HANDSHAKE_POLLS,
                        HANDSHAKE_INTERVAL,
                        || Ok(!regs.read_port(index)?.contains(PortSc::RESUME)),
                    )?;
                    if !done {
                        error!("port {} resume error", self.id());
                        return Err(HubError::ResumeTimeout(self.id()));
                    }
                    sc.remove(PortSc::SUSPEND | PortSc::RESUME | PortSc::LINE_STATUS);
                }
                Some(_) => {}
            }
        }

        if sc.contains(PortSc::RESET) && self.reset_deadline.is_none_or(|d| time_after_eq(now, d))
        {
            self.change_reset = true;
            self.resuming = false;
            self.reset_deadline = None;

            regs.write_port(index, sc.for_write().difference(PortSc::RESET))?;
            let done = handshake(
                env.kernel(),
                RESET_HANDSHAKE_POLLS,
                HANDSHAKE_INTERVAL,
                || Ok(!regs.read_port(index)?.contains(PortSc::RESET)),
            )?;
            if !done {
                error!("port {} reset error", self.id());
                return Err(HubError::ResetTimeout(self.id()));
            }
            sc = self.check_reset_complete(regs, env)?;
        }

        if !sc.intersects(PortSc::RESUME | PortSc::RESET) {
            self.reset_deadline = None;
            self.resuming = false;
        }

        if sc.contains(PortSc::CONNECT)
            && !sc.contains(PortSc::OWNER)
            && env.config.is_companion_port(index)
        {
            debug!("port {} --> companion", self.id());
            regs.write_port(index, sc.for_write() | PortSc::OWNER)?;
            sc = regs.read_port(index)?;
        }

        // 硬件自行退出挂起（复位或断开）时补报一次挂起变化
        if self.suspended && !sc.intersects(PortSc::SUSPEND | PortSc::RESUME) {
            self.suspended = false;
            if sc.contains(PortSc::PE) {
                self.change_suspend = true;
            }
        }

        self.owned_by_companion = sc.contains(PortSc::OWNER);
        Ok(sc)
    }

    /// 复位结束后检查端口是否使能；未使能说明是全速设备，交给 companion。
    fn check_reset_complete<R: EhciRegisters>(
        &mut self,
        regs: &mut R,
        env: &HubEnv,
    ) -> Result<PortSc> {
        let sc = regs.read_port(self.index)?;
        if !sc.contains(PortSc::CONNECT) {
            return Ok(sc);
        }

        if sc.contains(PortSc::PE) {
            debug!("port {} high speed", self.id());
            return Ok(sc);
        }

        if env.config.integrated_tt {
            debug!("Failed to enable port {} on root hub TT", self.id());
            return Ok(sc);
        }

        debug!("port {} full speed --> companion", self.id());
        regs.write_port(self.index, sc.for_write() | PortSc::OWNER)?;
        self.owned_by_companion = true;
        regs.read_port(self.index)
    }

    /// 由 PORTSC 和软件标志组装 wPortStatus/wPortChange
    pub(crate) fn status_word(&self, sc: PortSc, env: &HubEnv) -> PortStatusWord {
        let mut status = PortStatusBits::empty();

        if sc.contains(PortSc::CONNECT) {
            status |= PortStatusBits::CONNECTION;
            let speed = if env.config.integrated_tt {
                sc.tdi_speed()
            } else {
                DeviceSpeed::High
            };
            status |= speed.to_usb2_hub_status();
        }
        if sc.contains(PortSc::PE) {
            status |= PortStatusBits::ENABLE;
        }
        if sc.intersects(PortSc::SUSPEND | PortSc::RESUME) {
            status |= PortStatusBits::SUSPEND;
        }
        if sc.contains(PortSc::OC) {
            status |= PortStatusBits::OVER_CURRENT;
        }
        if sc.contains(PortSc::RESET) {
            status |= PortStatusBits::RESET;
        }
        if sc.contains(PortSc::POWER) {
            status |= PortStatusBits::POWER;
        }
        if sc.intersects(PortSc::TEST) {
            status |= PortStatusBits::TEST;
        }

        PortStatusWord {
            status,
            change: self.change_bits(sc, &env.config),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_derivation() {
        let port = Port::new(0);
        assert_eq!(port.state(PortSc::empty()), PortState::PoweredOff);
        assert_eq!(port.state(PortSc::POWER), PortState::Disconnected);
        assert_eq!(
            port.state(PortSc::POWER | PortSc::CONNECT),
            PortState::Connected
        );
        assert_eq!(
            port.state(PortSc::POWER | PortSc::CONNECT | PortSc::PE),
            PortState::Enabled
        );
        assert_eq!(
            port.state(PortSc::POWER | PortSc::CONNECT | PortSc::PE | PortSc::SUSPEND),
            PortState::Suspended
        );
        assert_eq!(
            port.state(PortSc::POWER | PortSc::CONNECT | PortSc::RESET),
            PortState::Resetting
        );
        assert_eq!(
            port.state(PortSc::POWER | PortSc::CONNECT | PortSc::OWNER),
            PortState::OwnedByCompanion
        );
    }

    #[test]
    fn test_state_from_software_flags() {
        let mut port = Port::new(2);
        let enabled = PortSc::POWER | PortSc::CONNECT | PortSc::PE;

        port.suspended = true;
        assert_eq!(port.state(enabled), PortState::Suspending);

        port.resuming = true;
        port.reset_deadline = Some(Duration::from_millis(20));
        assert_eq!(port.state(enabled | PortSc::SUSPEND), PortState::Resuming);

        port.resuming = false;
        port.suspended = false;
        assert_eq!(port.state(enabled), PortState::Resetting);
    }

    #[test]
    fn test_change_bits() {
        let mut port = Port::new(0);
        let mut config = EhciConfig::default();
        let sc = PortSc::CONNECT | PortSc::CSC | PortSc::OCC;

        assert_eq!(
            port.change_bits(sc, &config),
            PortChangeBits::C_CONNECTION | PortChangeBits::C_OVER_CURRENT
        );

        config.ignore_oc = true;
        port.change_reset = true;
        assert_eq!(
            port.change_bits(sc, &config),
            PortChangeBits::C_CONNECTION | PortChangeBits::C_RESET
        );
    }

    #[test]
    fn test_deadline_elapsed() {
        let mut port = Port::new(0);
        assert!(!port.deadline_elapsed(Duration::from_millis(100)));
        port.reset_deadline = Some(Duration::from_millis(50));
        assert!(!port.deadline_elapsed(Duration::from_millis(49)));
        assert!(port.deadline_elapsed(Duration::from_millis(50)));
        assert!(port.has_pending_change(
            PortSc::empty(),
            &EhciConfig::default(),
            Duration::from_millis(60)
        ));
    }
}
