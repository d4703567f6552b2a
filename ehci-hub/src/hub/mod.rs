//! EHCI Root Hub
//!
//! 所有寄存器访问和端口软件状态都放在一把自旋锁后面。
//! 需要等待毫秒级时间的流程（归属交接、总线挂起/恢复）在等待前释放锁，
//! 等待结束后重新获取并重新读取硬件状态。

use alloc::{sync::Arc, vec::Vec};
use core::time::Duration;

use spin::{Mutex, MutexGuard};
use usb_if::host::hub::PortStatusWord;

use crate::{
    config::EhciConfig,
    err::{HubError, Result},
    osal::{Kernel, handshake},
    port::{HubEnv, Port, PortState, RESUME_SIGNAL},
    reg::{EhciRegisters, HcsParams, MAX_PORTS, PortSc, UsbCmd, UsbSts},
};

mod control;
pub mod event;
mod pm;


use event::{HubEvent, HubEventHandler};

/// 交接归属时最多尝试的次数
const OWNER_TRIES: u32 = 4;
const OWNER_RETRY_DELAY: Duration = Duration::from_millis(5);
/// 有端口在恢复时，状态位图查询的重查间隔
const RESUME_REPOLL: Duration = Duration::from_millis(25);
const HALT_POLLS: u32 = 16 * 125;
const HALT_POLL_INTERVAL: Duration = Duration::from_micros(1);

/// Root Hub 运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RhState {
    Running,
    Suspended,
    Halted,
}

/// 归属交接结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffOutcome {
    Completed,
    /// 端口上已经没有设备，放弃交接
    Disconnected,
    /// 重试用尽，硬件仍未接受
    GaveUp,
    /// 集成 TT 的控制器没有 companion
    Unsupported,
}

/// 中断处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Nothing,
    /// 第一个有变化的端口（1-based）
    PortChange { port: u8 },
    ResumeRootHub,
}

/// Hub 状态变化位图（GetHubStatusData）
///
/// bit 0 是 Hub 自身，bit N 对应端口 N。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusChange {
    pub bitmap: u16,
    /// 有变化，或有端口正在恢复
    pub pending: bool,
    /// 建议多久以后再查一次
    pub repoll: Option<Duration>,
}

impl StatusChange {
    /// 写入中断端点数据，返回字节数；没有变化时为 0。
    pub fn write_to(&self, num_ports: usize, buf: &mut [u8]) -> usize {
        if !self.pending {
            return 0;
        }
        let len = if num_ports < 8 { 1 } else { 2 };
        let bytes = self.bitmap.to_le_bytes();
        let n = len.min(buf.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        n
    }
}

pub(crate) struct Inner<R> {
    pub(crate) regs: R,
    pub(crate) ports: Vec<Port>,
    pub(crate) rh_state: RhState,
    /// 总线挂起时被本驱动挂起的端口
    pub(crate) bus_suspended: u32,
    /// 总线挂起时归 companion 所有的端口
    pub(crate) owned_ports: u32,
    /// 挂起前保存的 USBCMD
    pub(crate) command: UsbCmd,
    /// 两次总线状态切换之间的最早时间
    pub(crate) next_statechange: Duration,
}

/// EHCI Root Hub
pub struct EhciRootHub<R: EhciRegisters> {
    inner: Mutex<Inner<R>>,
    env: HubEnv,
    events: HubEventHandler,
}

impl<R: EhciRegisters> EhciRootHub<R> {
    pub fn new(regs: R, kernel: Arc<dyn Kernel>, config: EhciConfig) -> Result<Self> {
        let mut regs = regs;
        let params = regs.hcs_params()?;
        let n_ports = (params.n_ports as usize).min(MAX_PORTS);
        if n_ports == 0 {
            error!("EHCI reports zero root hub ports");
            return Err(HubError::InvalidArgument);
        }

        let command = regs.read_command()?;
        let rh_state = if command.contains(UsbCmd::RUN) {
            RhState::Running
        } else {
            RhState::Halted
        };

        debug!(
            "EHCI root hub: {} ports, ppc={}, n_cc={}",
            n_ports, params.ppc, params.n_cc
        );

        Ok(Self {
            inner: Mutex::new(Inner {
                regs,
                ports: (0..n_ports).map(Port::new).collect(),
                rh_state,
                bus_suspended: 0,
                owned_ports: 0,
                command,
                next_statechange: Duration::ZERO,
            }),
            env: HubEnv {
                kernel,
                config,
                params,
            },
            events: HubEventHandler::new(),
        })
    }

    /// 给所有端口上电并启动控制器
    pub fn init(&self) -> Result {
        let mut g = self.lock();
        let n_ports = g.ports.len();

        if self.env.params.ppc {
            for i in 0..n_ports {
                let sc = g.regs.read_port(i)?;
                if !sc.contains(PortSc::POWER) {
                    trace!("Powering on port {}", i + 1);
                    g.regs.write_port(i, sc.for_write() | PortSc::POWER)?;
                }
            }
        }

        let command = g.regs.read_command()? | UsbCmd::RUN;
        g.regs.write_command(command)?;
        g.command = command;
        g.regs.write_intr_enable(UsbSts::INTR_MASK)?;
        g.rh_state = RhState::Running;
        debug!("EHCI root hub running with {n_ports} ports");
        Ok(())
    }

    pub fn port_count(&self) -> usize {
        self.lock().ports.len()
    }

    pub fn config(&self) -> &EhciConfig {
        &self.env.config
    }

    pub fn params(&self) -> &HcsParams {
        &self.env.params
    }

    pub fn rh_state(&self) -> RhState {
        self.lock().rh_state
    }

    pub fn events(&self) -> &HubEventHandler {
        &self.events
    }

    /// 端口当前的逻辑状态，到期的复位/恢复先收尾
    pub fn port_state(&self, port: u8) -> Result<PortState> {
        let i = self.port_index(port as u16)?;
        let mut g = self.lock();
        let Inner { regs, ports, .. } = &mut *g;
        let sc = regs.read_port(i)?;
        let sc = ports[i].finalize_if_due(regs, &self.env, sc)?;
        Ok(ports[i].state(sc))
    }

    fn lock(&self) -> MutexGuard<'_, Inner<R>> {
        self.inner.lock()
    }

    /// 1-based 端口号转为下标
    fn port_index(&self, port: u16) -> Result<usize> {
        let n_ports = self.lock().ports.len();
        if port == 0 || port as usize > n_ports {
            return Err(HubError::InvalidArgument);
        }
        Ok(port as usize - 1)
    }

    /// 汇总所有端口的待处理变化
    pub fn hub_status_data(&self) -> Result<StatusChange> {
        let mut g = self.lock();
        if g.rh_state != RhState::Running {
            return Ok(StatusChange::default());
        }

        let now = self.env.now();
        let mut bitmap = 0u16;
        let mut resuming = false;
        for i in 0..g.ports.len() {
            let sc = g.regs.read_port(i)?;
            let port = &g.ports[i];
            resuming |= port.resuming;
            if port.has_pending_change(sc, &self.env.config, now) {
                bitmap |= 1 << (i + 1);
            }
        }

        Ok(StatusChange {
            bitmap,
            pending: bitmap != 0 || resuming,
            repoll: resuming.then_some(RESUME_REPOLL),
        })
    }

    /// 中断处理：确认 USBSTS，端口变化推入事件队列。
    pub fn handle_irq(&self) -> Result<Event> {
        let mut g = self.lock();
        let status = g.regs.read_status()?;
        let ack = status.intersection(UsbSts::W1C);
        if ack.is_empty() {
            return Ok(Event::Nothing);
        }
        g.regs.write_status(ack)?;

        if !status.contains(UsbSts::PCD) {
            return Ok(Event::Nothing);
        }

        if g.rh_state == RhState::Suspended {
            debug!("port change while bus suspended, resume root hub");
            self.events.push(HubEvent::ResumeRootHub);
            return Ok(Event::ResumeRootHub);
        }

        let now = self.env.now();
        let mut first = None;
        let Inner { regs, ports, .. } = &mut *g;
        for port in ports.iter_mut() {
            let sc = regs.read_port(port.id() as usize - 1)?;

            if sc.contains(PortSc::RESUME) && !port.resuming && port.reset_deadline.is_none() {
                debug!("port {} remote wakeup", port.id());
                port.resuming = true;
                port.reset_deadline = Some(now + RESUME_SIGNAL);
            }

            if port.has_pending_change(sc, &self.env.config, now) || port.resuming {
                self.events.push(HubEvent::PortChange {
                    port: port.id(),
                    change: port.change_bits(sc, &self.env.config).into(),
                });
                first.get_or_insert(port.id());
            }
        }

        Ok(match first {
            Some(port) => Event::PortChange { port },
            None => Event::Nothing,
        })
    }

    /// 定时器回调：结束到期的复位/恢复信号，返回下一个截止时间的间隔。
    pub fn poll_timers(&self) -> Result<Option<Duration>> {
        let mut g = self.lock();
        let now = self.env.now();
        let Inner { regs, ports, .. } = &mut *g;

        for port in ports.iter_mut() {
            if !port.deadline_elapsed(now) {
                continue;
            }
            let sc = regs.read_port(port.id() as usize - 1)?;
            match port.finalize_if_due(regs, &self.env, sc) {
                Ok(_) => {}
                Err(e @ (HubError::ResetTimeout(_) | HubError::ResumeTimeout(_))) => {
                    warn!("{e}");
                }
                Err(e) => return Err(e),
            }
            self.events.push(HubEvent::PortDeadline { port: port.id() });
        }

        let now = self.env.now();
        Ok(ports
            .iter()
            .filter_map(|p| p.reset_deadline)
            .min()
            .map(|deadline| deadline.saturating_sub(now)))
    }

    /// 把端口交给 companion 控制器（或收回）。
    ///
    /// 控制器可能拒绝第一次写入，每次重试前释放锁等待 5ms。
    fn set_owner(&self, index: usize, companion: bool) -> Result<HandoffOutcome> {
        let want = if companion {
            PortSc::OWNER
        } else {
            PortSc::empty()
        };

        for remaining in (0..OWNER_TRIES).rev() {
            let mut g = self.lock();
            let sc = g.regs.read_port(index)?;
            if sc.intersection(PortSc::OWNER) == want {
                g.ports[index].owned_by_companion = companion;
                return Ok(HandoffOutcome::Completed);
            }
            if !sc.intersects(PortSc::OWNER | PortSc::CONNECT) {
                debug!("port {} disconnected during hand-off", index + 1);
                return Ok(HandoffOutcome::Disconnected);
            }

            let value = sc
                .for_write()
                .symmetric_difference(PortSc::OWNER)
                .difference(PortSc::PE);
            g.regs.write_port(index, value)?;
            drop(g);

            if remaining > 0 {
                self.env.kernel().delay(OWNER_RETRY_DELAY);
            }
        }

        warn!("port {} owner hand-off gave up", index + 1);
        Ok(HandoffOutcome::GaveUp)
    }

    /// 把端口上的设备交给 companion 控制器
    pub fn relinquish_port(&self, port: u8) -> Result<HandoffOutcome> {
        let i = self.port_index(port as u16)?;
        if self.env.config.integrated_tt {
            return Ok(HandoffOutcome::Unsupported);
        }
        self.set_owner(i, true)
    }

    /// 从 companion 收回端口
    pub fn reclaim_port(&self, port: u8) -> Result<HandoffOutcome> {
        let i = self.port_index(port as u16)?;
        if self.env.config.integrated_tt {
            return Ok(HandoffOutcome::Unsupported);
        }
        self.set_owner(i, false)
    }

    /// 端口是否已经归 companion
    pub fn port_handed_over(&self, port: u8) -> Result<bool> {
        let i = self.port_index(port as u16)?;
        if self.env.config.integrated_tt {
            return Ok(false);
        }
        let mut g = self.lock();
        Ok(g.regs.read_port(i)?.contains(PortSc::OWNER))
    }
}

impl<R: EhciRegisters> Inner<R> {
    /// 停止周期/异步调度
    fn quiesce(&mut self, env: &HubEnv) -> Result {
        let command = self.regs.read_command()?;
        if !command.intersects(UsbCmd::ASE | UsbCmd::PSE) {
            return Ok(());
        }
        self.regs
            .write_command(command.difference(UsbCmd::ASE | UsbCmd::PSE))?;
        let regs = &mut self.regs;
        let stopped = handshake(env.kernel(), HALT_POLLS, HALT_POLL_INTERVAL, || {
            Ok(!regs.read_status()?.intersects(UsbSts::ASS | UsbSts::PSS))
        })?;
        if !stopped {
            warn!("schedules did not stop");
        }
        Ok(())
    }

    /// 清 RUN 并等待 HALT，返回控制器是否已停止
    fn halt(&mut self, env: &HubEnv) -> Result<bool> {
        let command = self.regs.read_command()?;
        self.regs.write_command(command.difference(UsbCmd::RUN))?;
        let regs = &mut self.regs;
        let halted = handshake(env.kernel(), HALT_POLLS, HALT_POLL_INTERVAL, || {
            Ok(regs.read_status()?.contains(UsbSts::HALT))
        })?;
        if !halted {
            warn!("EHCI halt timeout");
        }
        Ok(halted)
    }

    /// GetPortStatus 的核心：处理过流、结束到期信号、组装状态字
    fn get_port_status(
        &mut self,
        index: usize,
        env: &HubEnv,
    ) -> Result<PortStatusWord> {
        let Inner { regs, ports, .. } = self;
        let port = &mut ports[index];

        let mut sc = regs.read_port(index)?;
        if sc.contains(PortSc::OCC)
            && sc.contains(PortSc::OC)
            && !env.config.ignore_oc
            && env.params.ppc
        {
            warn!("port {} over-current, power off", port.id());
            regs.write_port(index, sc.for_write().difference(PortSc::POWER))?;
            sc = regs.read_port(index)?;
        }

        let sc = port.finalize_if_due(regs, env, sc)?;
        let word = port.status_word(sc, env);
        if !word.change.is_empty() {
            debug!(
                "port {} status {:#06x} change {:#06x}",
                port.id(),
                word.status.bits(),
                word.change.bits()
            );
        }
        Ok(word)
    }

    /// 有未确认的端口变化
    fn port_change(&mut self) -> Result<bool> {
        if self.regs.read_status()?.contains(UsbSts::PCD) {
            return Ok(true);
        }
        for i in 0..self.ports.len() {
            if self.regs.read_port(i)?.contains(PortSc::CSC) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
