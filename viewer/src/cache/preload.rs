//! 先読み
//!
//! 現在の画像と次の画像をキャッシュに常駐させます。
//! 先読みの失敗は表示に影響しないため無視します。

use crate::cache::ImageCache;
use crate::playlist::Playlist;
use crate::view::ViewContext;
use log::{debug, trace};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// 現在位置からの先読み対象
pub const PRELOAD_OFFSETS: [isize; 2] = [0, 1];

/// デフォルトの先読み間隔
pub const DEFAULT_PRELOAD_INTERVAL: Duration = Duration::from_millis(200);

/// 先読みタスク
pub struct Preloader {
    ctx: Arc<ViewContext>,
    cache: Arc<ImageCache>,
    playlist: Arc<Playlist>,
    interval: Duration,
}

impl Preloader {
    /// 新しい先読みタスクを作成
    pub fn new(ctx: Arc<ViewContext>, cache: Arc<ImageCache>, playlist: Arc<Playlist>, interval: Duration) -> Self {
        Self {
            ctx,
            cache,
            playlist,
            interval,
        }
    }

    /// 先読み対象のパス
    pub fn lookahead(&self) -> Vec<PathBuf> {
        if self.playlist.is_empty() {
            return Vec::new();
        }
        let current = self.ctx.lock().index;

        let mut targets: Vec<PathBuf> = Vec::with_capacity(PRELOAD_OFFSETS.len());
        for offset in PRELOAD_OFFSETS {
            let index = self.playlist.wrap(current, offset);
            if let Some(path) = self.playlist.get(index) {
                if !targets.iter().any(|t| t == path) {
                    targets.push(path.to_path_buf());
                }
            }
        }
        targets
    }

    /// 1回分の先読み
    ///
    /// 新たにデコードした件数を返します。
    pub fn run_pass(&self) -> usize {
        let mut decoded = 0;
        for path in self.lookahead() {
            if self.cache.contains(&path) {
                continue;
            }
            trace!("先読みします: {}", path.display());
            if self.cache.ensure(&path).is_ok() {
                decoded += 1;
            }
        }
        decoded
    }

    /// 終了まで先読みを続ける
    pub fn run(&self) {
        if self.playlist.len() <= 1 {
            debug!("プレイリストが1件以下のため先読みしません");
            return;
        }

        debug!("先読みを開始します（間隔: {:?}）", self.interval);
        while self.ctx.is_running() {
            self.run_pass();
            thread::sleep(self.interval);
        }
        debug!("先読みを終了しました");
    }
}
