//! 后台循环
//!
//! 编排层启动三个命名线程：
//! - `gauss-supervisor`: 汇总连接状态、处理校准上报
//! - `gauss-can-loop`: 轮询 CAN 步进电机总线
//! - `gauss-dxl-loop`: 轮询 Dynamixel 执行器总线
//!
//! 每个循环在迭代开始时检查 [`LoopState`]：`Running` 执行一次 tick，`Paused` 跳过，
//! `Stopped` 退出。节拍由停止通道上的 `recv_deadline` 控制，停止时关闭通道即可
//! 立即唤醒所有循环。

use crate::mode::{AtomicLoopState, LoopState};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{Dispatch, debug, error, info_span, trace};

/// 线程名
pub const SUPERVISOR_THREAD: &str = "gauss-supervisor";
pub const CAN_LOOP_THREAD: &str = "gauss-can-loop";
pub const DXL_LOOP_THREAD: &str = "gauss-dxl-loop";

/// 循环运行所需的共享上下文
#[derive(Clone)]
pub struct LoopContext {
    pub state: Arc<AtomicLoopState>,
    /// 停止通道：发送端被 drop 时所有循环退出
    pub stop: Receiver<()>,
    /// 线程内使用的日志分发器
    pub dispatch: Dispatch,
}

/// 周期循环主体
///
/// 按固定节拍（`period`）调用 `tick`，错过的节拍不补。
pub fn run_periodic(name: &'static str, period: Duration, ctx: &LoopContext, mut tick: impl FnMut()) {
    let mut next = Instant::now();
    loop {
        match ctx.state.get() {
            LoopState::Stopped => {
                trace!("{}: stopped flag set, exiting", name);
                break;
            },
            LoopState::Paused => {},
            LoopState::Running => tick(),
        }

        next += period;
        let now = Instant::now();
        if next < now {
            next = now;
        }
        match ctx.stop.recv_deadline(next) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                trace!("{}: stop channel closed, exiting", name);
                break;
            },
        }
    }
}

/// 启动一个命名的周期线程
///
/// 线程在整个生命周期内使用 `ctx.dispatch` 作为默认日志分发器，并运行在以线程名
/// 命名的 span 中。
pub fn spawn_loop(
    name: &'static str,
    period: Duration,
    ctx: LoopContext,
    tick: impl FnMut() + Send + 'static,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new().name(name.to_string()).spawn(move || {
        let _dispatch_guard = tracing::dispatcher::set_default(&ctx.dispatch);
        let span = info_span!("hw_loop", thread = name);
        let _enter = span.enter();
        debug!("{} started, period {:?}", name, period);
        run_periodic(name, period, &ctx, tick);
        debug!("{} exited", name);
    })
}

/// 带超时的 join
pub trait JoinTimeout {
    fn join_timeout(self, timeout: Duration) -> std::thread::Result<()>;
}

impl<T: Send + 'static> JoinTimeout for JoinHandle<T> {
    fn join_timeout(self, timeout: Duration) -> std::thread::Result<()> {
        let (tx, rx) = crossbeam_channel::bounded(1);

        // 看门狗线程负责真正的 join；超时后它继续等待，进程退出时由 OS 回收
        thread::spawn(move || {
            let _ = tx.send(self.join());
        });

        match rx.recv_timeout(timeout) {
            Ok(join_result) => join_result.map(|_| ()),
            Err(RecvTimeoutError::Timeout) => Err(Box::new(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "Thread join timeout",
            ))),
            Err(RecvTimeoutError::Disconnected) => Err(Box::new(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "Thread panicked during join",
            ))),
        }
    }
}

/// 一组运行中的循环线程
pub struct Workers {
    stop: Option<crossbeam_channel::Sender<()>>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl Workers {
    pub fn new(stop: crossbeam_channel::Sender<()>) -> Self {
        Self {
            stop: Some(stop),
            handles: Vec::new(),
        }
    }

    pub fn push(&mut self, name: &'static str, handle: JoinHandle<()>) {
        self.handles.push((name, handle));
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.handles.iter().map(|(name, _)| *name).collect()
    }

    pub fn thread_ids(&self) -> Vec<thread::ThreadId> {
        self.handles.iter().map(|(_, handle)| handle.thread().id()).collect()
    }

    /// 关闭停止通道并等待所有线程退出
    pub fn shutdown(mut self, timeout: Duration) {
        // 先 drop 发送端，循环的 recv_deadline 才会收到 Disconnected
        self.stop.take();
        for (name, handle) in self.handles.drain(..) {
            if let Err(_e) = handle.join_timeout(timeout) {
                error!("{} panicked or failed to shut down within {:?}", name, timeout);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn context(state: LoopState) -> (crossbeam_channel::Sender<()>, LoopContext) {
        let (tx, rx) = crossbeam_channel::bounded(0);
        let ctx = LoopContext {
            state: Arc::new(AtomicLoopState::new(state)),
            stop: rx,
            dispatch: tracing::dispatcher::get_default(|d| d.clone()),
        };
        (tx, ctx)
    }

    #[test]
    fn test_loop_ticks_until_stop_channel_closes() {
        let (tx, ctx) = context(LoopState::Running);
        let ticks = Arc::new(AtomicU32::new(0));
        let counter = ticks.clone();
        let handle = spawn_loop("test-loop", Duration::from_millis(1), ctx, move || {
            counter.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();

        thread::sleep(Duration::from_millis(30));
        drop(tx);
        handle.join_timeout(Duration::from_secs(1)).unwrap();
        assert!(ticks.load(Ordering::Relaxed) > 1);
    }

    #[test]
    fn test_paused_loop_does_not_tick() {
        let (tx, ctx) = context(LoopState::Paused);
        let ticks = Arc::new(AtomicU32::new(0));
        let counter = ticks.clone();
        let state = ctx.state.clone();
        let handle = spawn_loop("paused-loop", Duration::from_millis(1), ctx, move || {
            counter.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();

        thread::sleep(Duration::from_millis(20));
        assert_eq!(ticks.load(Ordering::Relaxed), 0);

        state.set(LoopState::Running);
        thread::sleep(Duration::from_millis(20));
        assert!(ticks.load(Ordering::Relaxed) > 0);
        drop(tx);
        handle.join_timeout(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_stopped_flag_exits_without_channel_close() {
        let (_tx, ctx) = context(LoopState::Stopped);
        let handle = spawn_loop("stopped-loop", Duration::from_secs(10), ctx, || {}).unwrap();
        handle.join_timeout(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_workers_shutdown_joins_all() {
        let (tx, ctx) = context(LoopState::Running);
        let mut workers = Workers::new(tx);
        for name in [CAN_LOOP_THREAD, DXL_LOOP_THREAD] {
            workers.push(
                name,
                spawn_loop(name, Duration::from_secs(10), ctx.clone(), || {}).unwrap(),
            );
        }
        drop(ctx);
        assert_eq!(workers.names(), vec![CAN_LOOP_THREAD, DXL_LOOP_THREAD]);

        let started = Instant::now();
        workers.shutdown(Duration::from_secs(1));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
