//! 转写去抖
//!
//! 上游语音识别按片段增量吐出；逐片段触发推理会带来冗余调用与重复落库，
//! 所以聚合由"静默"触发而非"到片段"触发：冲刷总是发生在最后一个片段之后
//! D 毫秒，而不是第一个片段之后。
//!
//! 状态机两态：Idle（空缓冲、无定时器）/ Accumulating（非空缓冲、恰好一个
//! 在途定时器）。单槽定时器：append 先作废旧定时器（abort + 纪元自增）再
//! 起新的，同一缓冲上绝不会有两次冲刷竞争。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;

/// 冲刷回调：拿到聚合后的完整话语
pub type FlushHandler = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

struct DebounceInner {
    fragments: Vec<String>,
    timer: Option<tokio::task::JoinHandle<()>>,
    /// 每次（重）启定时器自增；到期任务凭纪元判断自己是否已被作废
    epoch: u64,
}

/// 转写去抖器：一个认知会话独占一个
pub struct TranscriptionDebouncer {
    inner: Arc<Mutex<DebounceInner>>,
    delay: Duration,
    handler: FlushHandler,
}

impl TranscriptionDebouncer {
    pub fn new<F>(delay: Duration, handler: F) -> Self
    where
        F: Fn(String) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(DebounceInner {
                fragments: Vec::new(),
                timer: None,
                epoch: 0,
            })),
            delay,
            handler: Arc::new(handler),
        }
    }

    /// 追加一个片段并把冲刷定时器归零重启
    pub fn append(&self, fragment: &str) {
        if fragment.trim().is_empty() {
            return;
        }

        let mut inner = self.inner.lock().unwrap();
        inner.fragments.push(fragment.to_string());

        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        inner.epoch = inner.epoch.wrapping_add(1);
        let epoch = inner.epoch;

        let state = Arc::clone(&self.inner);
        let handler = Arc::clone(&self.handler);
        let delay = self.delay;
        inner.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let utterance = {
                let mut inner = state.lock().unwrap();
                if inner.epoch != epoch {
                    // 睡眠期间有新片段进来，本次冲刷已被作废
                    return;
                }
                inner.timer = None;
                let fragments: Vec<String> = inner.fragments.drain(..).collect();
                fragments.join(" ").trim().to_string()
            };

            if !utterance.is_empty() {
                handler(utterance).await;
            }
        }));
    }

    /// 会话拆除：作废在途定时器并清空缓冲
    pub fn cancel(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        inner.epoch = inner.epoch.wrapping_add(1);
        inner.fragments.clear();
    }

    /// 是否处于 Accumulating 态（缓冲非空）
    pub fn is_accumulating(&self) -> bool {
        !self.inner.lock().unwrap().fragments.is_empty()
    }
}

impl Drop for TranscriptionDebouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    fn collecting_debouncer(
        delay_ms: u64,
    ) -> (TranscriptionDebouncer, Arc<Mutex<Vec<String>>>) {
        let flushed: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&flushed);
        let debouncer = TranscriptionDebouncer::new(Duration::from_millis(delay_ms), move |utterance| {
            let sink = Arc::clone(&sink);
            Box::pin(async move {
                sink.lock().unwrap().push(utterance);
            })
        });
        (debouncer, flushed)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_fragments_flush_once_joined() {
        let (debouncer, flushed) = collecting_debouncer(1500);

        debouncer.append("Remind");
        settle().await;
        advance(Duration::from_millis(200)).await;
        debouncer.append("me to");
        settle().await;
        advance(Duration::from_millis(200)).await;
        debouncer.append("call mom");
        settle().await;

        // 尚未静默足够久：没有冲刷
        advance(Duration::from_millis(1400)).await;
        settle().await;
        assert!(flushed.lock().unwrap().is_empty());

        advance(Duration::from_millis(200)).await;
        settle().await;
        let got = flushed.lock().unwrap().clone();
        assert_eq!(got, vec!["Remind me to call mom".to_string()]);
        assert!(!debouncer.is_accumulating());
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_append_after_flush_starts_fresh_cycle() {
        let (debouncer, flushed) = collecting_debouncer(1000);

        debouncer.append("first utterance");
        settle().await;
        advance(Duration::from_millis(1100)).await;
        settle().await;

        debouncer.append("second");
        debouncer.append("utterance");
        settle().await;
        advance(Duration::from_millis(1100)).await;
        settle().await;

        let got = flushed.lock().unwrap().clone();
        assert_eq!(
            got,
            vec!["first utterance".to_string(), "second utterance".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_restarts_from_last_fragment() {
        let (debouncer, flushed) = collecting_debouncer(1000);

        // 每 900ms 一个片段，始终没有 1000ms 的静默
        for i in 0..4 {
            debouncer.append(&format!("f{}", i));
            settle().await;
            advance(Duration::from_millis(900)).await;
            settle().await;
            assert!(flushed.lock().unwrap().is_empty());
        }

        advance(Duration::from_millis(200)).await;
        settle().await;
        let got = flushed.lock().unwrap().clone();
        assert_eq!(got, vec!["f0 f1 f2 f3".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_discards_pending_flush() {
        let (debouncer, flushed) = collecting_debouncer(1000);

        debouncer.append("doomed");
        debouncer.cancel();
        advance(Duration::from_millis(2000)).await;
        settle().await;

        assert!(flushed.lock().unwrap().is_empty());
        assert!(!debouncer.is_accumulating());
    }

    #[tokio::test(start_paused = true)]
    async fn test_whitespace_fragments_ignored() {
        let (debouncer, flushed) = collecting_debouncer(1000);

        debouncer.append("   ");
        advance(Duration::from_millis(2000)).await;
        settle().await;

        assert!(flushed.lock().unwrap().is_empty());
    }
}
