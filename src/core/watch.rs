//! 实时模式 - 把文件系统事件转换为单路径同步

use crate::core::report::SyncReport;
use crate::error::SyncError;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Created,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub kind: WatchEventKind,
}

/// 启动递归监听，返回监听器（需保持存活）和事件接收端
pub fn start_watcher(
    root: &Path,
) -> notify::Result<(RecommendedWatcher, mpsc::UnboundedReceiver<WatchEvent>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            for mapped in map_event(event) {
                let _ = tx.send(mapped);
            }
        }
        Err(e) => warn!("文件监听错误: {}", e),
    })?;
    watcher.watch(root, RecursiveMode::Recursive)?;
    info!("开始监听: {:?}", root);
    Ok((watcher, rx))
}

fn map_event(event: Event) -> Vec<WatchEvent> {
    let kind = match event.kind {
        // 重命名：旧路径按删除处理，新路径按创建处理
        EventKind::Modify(notify::event::ModifyKind::Name(_)) if event.paths.len() >= 2 => {
            let mut paths = event.paths.into_iter();
            return paths
                .next()
                .map(|from| WatchEvent {
                    path: from,
                    kind: WatchEventKind::Removed,
                })
                .into_iter()
                .chain(paths.map(|to| WatchEvent {
                    path: to,
                    kind: WatchEventKind::Created,
                }))
                .collect();
        }
        EventKind::Create(_) => WatchEventKind::Created,
        EventKind::Modify(_) => WatchEventKind::Modified,
        EventKind::Remove(_) => WatchEventKind::Removed,
        _ => return Vec::new(),
    };
    event
        .paths
        .into_iter()
        .map(|path| WatchEvent { path, kind })
        .collect()
}

/// 防抖队列：同一路径只保留最新事件，安静期满后才交付
pub struct DebouncedQueue {
    pending: HashMap<PathBuf, (WatchEvent, Instant)>,
    window: Duration,
}

impl DebouncedQueue {
    pub fn new(window: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            window,
        }
    }

    /// 新事件会重置该路径的安静期
    pub fn push(&mut self, event: WatchEvent) {
        self.pending
            .insert(event.path.clone(), (event, Instant::now()));
    }

    /// 取出所有已稳定的事件，按稳定先后排序
    pub fn poll(&mut self) -> Vec<WatchEvent> {
        let now = Instant::now();
        let window = self.window;
        let mut settled: Vec<(Instant, WatchEvent)> = Vec::new();
        self.pending.retain(|_, (event, at)| {
            if now.duration_since(*at) >= window {
                settled.push((*at, event.clone()));
                false
            } else {
                true
            }
        });
        settled.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.path.cmp(&b.1.path)));
        settled.into_iter().map(|(_, event)| event).collect()
    }

    /// 最早一个事件稳定的时刻
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .values()
            .map(|(_, at)| *at + self.window)
            .min()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// 能执行单路径同步的对象
#[async_trait]
pub trait PathSync: Send + Sync {
    async fn sync_path(&self, relative: &str) -> Result<SyncReport, SyncError>;
}

/// 事件桥：生产端防抖，单个消费者按稳定顺序执行同步
pub struct WatchBridge<S: PathSync> {
    sync: Arc<S>,
    root: PathBuf,
    debounce: Duration,
    reports: Option<mpsc::UnboundedSender<SyncReport>>,
}

impl<S: PathSync> WatchBridge<S> {
    pub fn new(sync: Arc<S>, root: impl Into<PathBuf>, debounce: Duration) -> Self {
        Self {
            sync,
            root: root.into(),
            debounce,
            reports: None,
        }
    }

    /// 每轮完成后把报告发送到这个通道
    pub fn with_reports(mut self, reports: mpsc::UnboundedSender<SyncReport>) -> Self {
        self.reports = Some(reports);
        self
    }

    /// 运行直到事件源关闭或被取消；进行中的同步不会被打断
    pub async fn run<St>(self, events: St, cancel: CancellationToken)
    where
        St: Stream<Item = WatchEvent> + Unpin,
    {
        let mut events = events;
        let mut queue = DebouncedQueue::new(self.debounce);

        loop {
            let deadline = queue.next_deadline();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events.next() => match event {
                    Some(event) => {
                        debug!("文件事件: {:?} {:?}", event.kind, event.path);
                        queue.push(event);
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(|| Instant::now() + self.debounce)),
                    if deadline.is_some() => {}
            }

            for event in queue.poll() {
                if cancel.is_cancelled() {
                    break;
                }
                self.run_pass(&event).await;
            }
        }
        info!("实时同步已停止 (未处理事件: {})", queue.len());
    }

    async fn run_pass(&self, event: &WatchEvent) {
        let Some(relative) = self.relative(&event.path) else {
            return;
        };
        match self.sync.sync_path(&relative).await {
            Ok(report) => {
                if let Some(reports) = &self.reports {
                    let _ = reports.send(report);
                }
            }
            Err(e) => warn!("实时同步失败: {} - {}", relative, e),
        }
    }

    fn relative(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let relative = relative.to_string_lossy().replace('\\', "/");
        if relative.is_empty() {
            return None;
        }
        Some(relative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::report::Operation;
    use std::sync::Mutex;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PathSync for Recorder {
        async fn sync_path(&self, relative: &str) -> Result<SyncReport, SyncError> {
            self.calls.lock().unwrap().push(relative.to_string());
            Ok(SyncReport::begin(Operation::SyncPath))
        }
    }

    fn event(path: &str, kind: WatchEventKind) -> WatchEvent {
        WatchEvent {
            path: PathBuf::from(path),
            kind,
        }
    }

    #[test]
    fn maps_rename_into_remove_and_create() {
        let mapped = map_event(Event {
            kind: EventKind::Modify(notify::event::ModifyKind::Name(
                notify::event::RenameMode::Both,
            )),
            paths: vec![PathBuf::from("/v/a.md"), PathBuf::from("/v/b.md")],
            attrs: Default::default(),
        });
        assert_eq!(
            mapped,
            vec![
                event("/v/a.md", WatchEventKind::Removed),
                event("/v/b.md", WatchEventKind::Created),
            ]
        );

        let access = map_event(Event {
            kind: EventKind::Access(notify::event::AccessKind::Any),
            paths: vec![PathBuf::from("/v/a.md")],
            attrs: Default::default(),
        });
        assert!(access.is_empty());
    }

    #[test]
    fn queue_keeps_latest_event_per_path() {
        let mut queue = DebouncedQueue::new(Duration::ZERO);
        queue.push(event("/v/a.md", WatchEventKind::Created));
        queue.push(event("/v/a.md", WatchEventKind::Modified));
        queue.push(event("/v/b.md", WatchEventKind::Removed));
        assert_eq!(queue.len(), 2);

        let settled = queue.poll();
        assert_eq!(settled.len(), 2);
        assert_eq!(settled[0].kind, WatchEventKind::Modified);
        assert!(queue.is_empty());
        assert!(queue.next_deadline().is_none());
    }

    #[test]
    fn queue_holds_events_inside_window() {
        let mut queue = DebouncedQueue::new(Duration::from_secs(60));
        queue.push(event("/v/a.md", WatchEventKind::Modified));
        assert!(queue.poll().is_empty());
        assert!(queue.next_deadline().is_some());
    }

    #[tokio::test]
    async fn bursts_collapse_into_one_pass_per_path() {
        let recorder = Arc::new(Recorder::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let (reports_tx, mut reports_rx) = mpsc::unbounded_channel();
        let bridge = WatchBridge::new(recorder.clone(), "/v", Duration::from_millis(50))
            .with_reports(reports_tx);
        let handle = tokio::spawn(bridge.run(
            UnboundedReceiverStream::new(rx),
            CancellationToken::new(),
        ));

        for _ in 0..5 {
            tx.send(event("/v/notes/a.md", WatchEventKind::Modified)).unwrap();
        }
        tx.send(event("/v/b.md", WatchEventKind::Created)).unwrap();
        tx.send(event("/elsewhere/c.md", WatchEventKind::Created)).unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        drop(tx);
        handle.await.unwrap();

        let calls = recorder.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 2);
        assert!(calls.contains(&"notes/a.md".to_string()));
        assert!(calls.contains(&"b.md".to_string()));
        assert!(reports_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn cancellation_stops_the_bridge() {
        let recorder = Arc::new(Recorder::default());
        let (tx, rx) = mpsc::unbounded_channel::<WatchEvent>();
        let cancel = CancellationToken::new();
        let bridge = WatchBridge::new(recorder.clone(), "/v", Duration::from_secs(60));
        let handle = tokio::spawn(bridge.run(UnboundedReceiverStream::new(rx), cancel.clone()));

        tx.send(event("/v/a.md", WatchEventKind::Modified)).unwrap();
        cancel.cancel();
        handle.await.unwrap();
        assert!(recorder.calls.lock().unwrap().is_empty());
    }
}
