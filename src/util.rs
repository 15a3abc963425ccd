use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::{env, str::FromStr};

use tokio::sync::Notify;

pub fn setup_logging(who: &str, level_arg: &str) {
    use fern::colors::{Color, ColoredLevelConfig};

    let colors = ColoredLevelConfig::new().info(Color::Green).error(Color::Red).warn(Color::Yellow);
    let level = env::var("RUST_LOG").unwrap_or(level_arg.to_string());
    let who = who.to_string();
    fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "[{} {}/{} {}] {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                who,
                record.target(),
                colors.color(record.level()),
                message
            ))
        })
        .level(log::LevelFilter::from_str(&level).expect("level"))
        .level_for("h2", log::LevelFilter::Info)
        .level_for("hyper", log::LevelFilter::Info)
        .level_for("tokio_postgres", log::LevelFilter::Info)
        .chain(std::io::stdout())
        .apply()
        .expect("log config");
}

/// Counts in-flight tasks so a stopping stream adapter can let them drain
/// before tearing the transport down.
#[derive(Clone, Default)]
pub struct WaitGroup {
    inner: Arc<WaitGroupInner>,
}

#[derive(Default)]
struct WaitGroupInner {
    count: AtomicUsize,
    notify: Notify,
}

pub struct WaitGroupGuard {
    inner: Arc<WaitGroupInner>,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self) -> WaitGroupGuard {
        self.inner.count.fetch_add(1, Ordering::AcqRel);
        WaitGroupGuard { inner: self.inner.clone() }
    }

    /// Resolves once every outstanding guard has dropped.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.inner.count.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for WaitGroupGuard {
    fn drop(&mut self) {
        if self.inner.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_waitgroup_drains() {
        let wg = WaitGroup::new();
        let g1 = wg.add();
        let g2 = wg.add();
        let wg2 = wg.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(g1);
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(g2);
        });
        wg2.wait().await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_waitgroup_empty_wait() {
        WaitGroup::new().wait().await;
    }
}
