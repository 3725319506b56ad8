//! 后台周期任务：心跳超时回收、输入状态过期广播。
//! 两个任务都在关闭信号到来时退出。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::gateway::Gateway;

pub fn spawn_heartbeat_reaper(
    gateway: Arc<Gateway>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = gateway.reap_idle().await;
                    if !reaped.is_empty() {
                        info!(count = reaped.len(), "回收心跳超时的连接");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("心跳回收任务退出");
    })
}

pub fn spawn_typing_sweeper(
    gateway: Arc<Gateway>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let expired = gateway.expire_typing();
                    if expired > 0 {
                        debug!(conversations = expired, "输入状态过期");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("输入状态清理任务退出");
    })
}
