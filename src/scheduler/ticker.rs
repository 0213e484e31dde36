//! Ticker Abstraction
//!
//! 周期実行のティック源（実時間インターバル／テスト用手動ティック）

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};

/// ティック源
#[async_trait]
pub trait Ticker: Send {
    /// 次のティックまで待機する。ティック源が閉じた場合は `false`
    async fn tick(&mut self) -> bool;
}

/// tokio インターバルによるティック源（最初のティックは即時）
pub struct IntervalTicker {
    interval: Interval,
}

impl IntervalTicker {
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        // 遅延したティックはまとめて発火させない
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { interval }
    }
}

#[async_trait]
impl Ticker for IntervalTicker {
    async fn tick(&mut self) -> bool {
        self.interval.tick().await;
        true
    }
}

/// 手動ティック源
pub struct ManualTicker {
    rx: mpsc::UnboundedReceiver<()>,
}

/// 手動ティックの送信ハンドル（ドロップでティック源が閉じる）
#[derive(Clone)]
pub struct TickHandle {
    tx: mpsc::UnboundedSender<()>,
}

impl ManualTicker {
    pub fn new() -> (Self, TickHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { rx }, TickHandle { tx })
    }
}

impl TickHandle {
    /// ティックを1回発火
    pub fn tick(&self) -> bool {
        self.tx.send(()).is_ok()
    }
}

#[async_trait]
impl Ticker for ManualTicker {
    async fn tick(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }
}
