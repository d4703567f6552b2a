//! 总线挂起/恢复与 companion 端口交接

use core::time::Duration;

use super::{EhciRootHub, Inner, RhState, event::HubEvent};
use crate::{
    err::{HubError, Result},
    osal::handshake,
    port::RESUME_SIGNAL,
    reg::{EhciRegisters, PortSc, UsbCmd, UsbSts},
};

/// 两次总线状态切换之间的最小间隔
const STATECHANGE_WAIT: Duration = Duration::from_millis(5);
/// 挂起后到允许恢复的间隔
const SUSPEND_HOLDOFF: Duration = Duration::from_millis(10);
/// 写 SUSPEND 后等待端口真正进入挂起
const SUSPEND_SETTLE: Duration = Duration::from_micros(150);
/// 重新置 RUN 后等待控制器稳定
const RESUME_SETTLE: Duration = Duration::from_millis(8);
const HANDOVER_SETTLE: Duration = Duration::from_millis(20);
/// 交接前的复位要等复位信号结束
const HANDOVER_RESET_WAIT: Duration = Duration::from_millis(90);

const RESUME_HANDSHAKE_POLLS: u32 = 2000;
const HANDSHAKE_INTERVAL: Duration = Duration::from_micros(1);

impl<R: EhciRegisters> EhciRootHub<R> {
    /// 距离上一次状态切换太近时先等一会
    fn wait_statechange(&self) {
        let next = self.lock().next_statechange;
        if self.env.now() < next {
            self.env.kernel().delay(STATECHANGE_WAIT);
        }
    }

    /// 挂起整条总线
    ///
    /// 有端口正在恢复时返回 [`HubError::Busy`]，不改动任何状态。
    pub fn bus_suspend(&self) -> Result {
        self.wait_statechange();

        let mut g = self.lock();
        if let Some(port) = g.ports.iter().find(|p| p.resuming) {
            debug!("suspend failed because port {} is resuming", port.id());
            return Err(HubError::Busy);
        }

        if g.rh_state == RhState::Running {
            g.quiesce(&self.env)?;
        }
        g.command = g.regs.read_command()?;

        g.bus_suspended = 0;
        g.owned_ports = 0;
        let remote_wakeup = self.env.config.remote_wakeup;
        for i in (0..g.ports.len()).rev() {
            let t1 = g.regs.read_port(i)?.for_write();
            let mut t2 = t1.difference(PortSc::WAKE);

            if t1.contains(PortSc::OWNER) {
                g.owned_ports |= 1 << i;
            } else if t1.contains(PortSc::PE) && !t1.contains(PortSc::SUSPEND) {
                t2 |= PortSc::SUSPEND;
                g.bus_suspended |= 1 << i;
            }

            if remote_wakeup {
                t2 |= t1.wake_bits_for_connect();
            }

            if t1 != t2 {
                trace!("port {}, {:#010x} -> {:#010x}", i + 1, t1.bits(), t2.bits());
                g.regs.write_port(i, t2)?;
            }
        }

        if g.bus_suspended != 0 {
            drop(g);
            self.env.kernel().delay(SUSPEND_SETTLE);
            g = self.lock();
        }

        g.halt(&self.env)?;
        g.rh_state = RhState::Suspended;

        let mut mask = UsbSts::INTR_MASK;
        if !remote_wakeup {
            mask.remove(UsbSts::PCD);
        }
        g.regs.write_intr_enable(mask)?;
        g.next_statechange = self.env.now() + SUSPEND_HOLDOFF;

        debug!(
            "bus suspended, ports {:#x}, companion {:#x}",
            g.bus_suspended, g.owned_ports
        );
        Ok(())
    }

    /// 恢复总线，对挂起时由本驱动挂起的端口发恢复信号
    pub fn bus_resume(&self) -> Result {
        self.wait_statechange();

        let mut g = self.lock();
        if !g.regs.accessible() {
            return Err(HubError::Shutdown);
        }

        // 中断使能被清零说明控制器掉过电
        let power_okay = !g.regs.read_intr_enable()?.is_empty();
        debug!(
            "resume root hub{}",
            if power_okay { "" } else { " after power loss" }
        );

        g.regs.write_intr_enable(UsbSts::empty())?;
        let command = g.command | UsbCmd::RUN;
        g.regs.write_command(command)?;
        g.rh_state = RhState::Running;
        drop(g);

        self.env.kernel().delay(RESUME_SETTLE);

        let mut g = self.lock();
        let mut resume_needed = 0u32;
        for i in (0..g.ports.len()).rev() {
            let mut sc = g.regs.read_port(i)?.for_write().difference(PortSc::WAKE);
            if g.bus_suspended & (1 << i) != 0 && sc.contains(PortSc::SUSPEND) {
                sc |= PortSc::RESUME;
                resume_needed |= 1 << i;
            }
            g.regs.write_port(i, sc)?;
        }

        if resume_needed != 0 {
            drop(g);
            self.env.kernel().delay(RESUME_SIGNAL);
            g = self.lock();
        }

        let mut result = Ok(());
        for i in (0..g.ports.len()).rev() {
            if resume_needed & (1 << i) == 0 {
                continue;
            }
            let sc = g.regs.read_port(i)?;
            g.regs.write_port(i, sc.for_write().difference(PortSc::RESUME))?;

            let regs = &mut g.regs;
            let done = handshake(
                self.env.kernel(),
                RESUME_HANDSHAKE_POLLS,
                HANDSHAKE_INTERVAL,
                || Ok(!regs.read_port(i)?.contains(PortSc::RESUME)),
            )?;
            if done {
                trace!("resumed port {}", i + 1);
            } else {
                error!("port {} resume error", i + 1);
                result = Err(HubError::ResumeTimeout(i as u8 + 1));
            }
        }

        g.bus_suspended = 0;
        g.regs.write_intr_enable(UsbSts::INTR_MASK)?;
        g.next_statechange = self.env.now() + STATECHANGE_WAIT;
        drop(g);

        self.handover_companion_ports()?;
        result
    }

    /// 挂起前归 companion 的端口，恢复后（可能掉过电）重新交接
    pub fn handover_companion_ports(&self) -> Result {
        if self.lock().owned_ports == 0 {
            return Ok(());
        }

        self.env.kernel().delay(HANDOVER_SETTLE);

        let mut g = self.lock();
        for i in (0..g.ports.len()).rev() {
            if g.owned_ports & (1 << i) == 0 {
                continue;
            }
            let sc = g.regs.read_port(i)?.for_write();
            if sc.contains(PortSc::OWNER) {
                // 归属没丢，不用处理
                g.owned_ports &= !(1 << i);
            } else if self.env.config.is_companion_port(i) {
                g.regs.write_port(i, sc.difference(PortSc::PE))?;
            } else {
                let Inner { regs, ports, .. } = &mut *g;
                match ports[i].reset(regs, &self.env) {
                    Err(e @ HubError::Io(_)) => return Err(e),
                    Err(e) => debug!("port {} handover reset: {e}", i + 1),
                    Ok(()) => {}
                }
            }
        }

        if g.owned_ports == 0 {
            return Ok(());
        }
        drop(g);

        self.env.kernel().delay(HANDOVER_RESET_WAIT);

        let mut g = self.lock();
        for i in (0..g.ports.len()).rev() {
            if g.owned_ports & (1 << i) == 0 {
                continue;
            }
            // 借助状态查询结束复位，全速设备在这里交给 companion
            match g.get_port_status(i, &self.env) {
                Err(e @ HubError::Io(_)) => return Err(e),
                Err(e) => debug!("port {} handover status: {e}", i + 1),
                Ok(_) => {}
            }

            let sc = g.regs.read_port(i)?.for_write();
            if sc.contains(PortSc::OWNER) {
                g.regs.write_port(i, sc | PortSc::CSC)?;
            } else {
                debug!("failed handover port {}: {:#010x}", i + 1, sc.bits());
                g.regs.write_port(i, sc.difference(PortSc::PE))?;
            }
        }

        g.owned_ports = 0;
        Ok(())
    }

    /// 主机挂起/恢复时调整端口唤醒条件
    ///
    /// 上层不需要远程唤醒时，挂起期间关掉所有唤醒源，恢复时再按连接状态打开。
    /// 返回 true 表示恢复时发现了端口变化，已推送 [`HubEvent::ResumeRootHub`]。
    pub fn adjust_port_wakeup_flags(&self, suspending: bool, do_wakeup: bool) -> Result<bool> {
        if !self.env.config.remote_wakeup || do_wakeup {
            return Ok(false);
        }

        let mut g = self.lock();
        for i in 0..g.ports.len() {
            let t1 = g.regs.read_port(i)?.for_write();
            let mut t2 = t1.difference(PortSc::WAKE);
            if !suspending {
                t2 |= t1.wake_bits_for_connect();
            }
            g.regs.write_port(i, t2)?;
        }

        if !suspending && g.port_change()? {
            self.events.push(HubEvent::ResumeRootHub);
            return Ok(true);
        }
        Ok(false)
    }

    /// 是否有未确认的端口变化
    pub fn port_change(&self) -> Result<bool> {
        self.lock().port_change()
    }
}
