//! 画像の切り替え
//!
//! キャッシュから画像を取得して表示状態に反映します。
//! デコードは状態ロックの外で行います。

use crate::cache::{Image, ImageCache};
use crate::playlist::Playlist;
use crate::view::ViewContext;
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// 画像ナビゲータ
pub struct Navigator {
    ctx: Arc<ViewContext>,
    cache: Arc<ImageCache>,
    playlist: Arc<Playlist>,
    /// 読み込み失敗時に表示する画像
    fallback: Option<PathBuf>,
}

impl Navigator {
    /// 新しいナビゲータを作成
    pub fn new(ctx: Arc<ViewContext>, cache: Arc<ImageCache>, playlist: Arc<Playlist>, fallback: Option<PathBuf>) -> Self {
        Self {
            ctx,
            cache,
            playlist,
            fallback,
        }
    }

    /// プレイリスト
    pub fn playlist(&self) -> &Arc<Playlist> {
        &self.playlist
    }

    /// 画像を取得
    ///
    /// 失敗した場合はデフォルト画像を試し、それもなければ `None` を返します。
    pub fn fetch(&self, path: &Path) -> Option<Arc<Image>> {
        match self.cache.ensure(path) {
            Ok(image) => return Some(image),
            Err(e) => warn!("{}", e),
        }

        let fallback = self.fallback.as_deref().filter(|fallback| *fallback != path)?;
        match self.cache.ensure(fallback) {
            Ok(image) => {
                info!("デフォルト画像を表示します: {}", fallback.display());
                Some(image)
            },
            Err(e) => {
                warn!("デフォルト画像も読み込めません: {}", e);
                None
            },
        }
    }

    /// プレイリスト上の画像を取得
    pub fn fetch_index(&self, index: usize) -> Option<Arc<Image>> {
        let path = self.playlist.get(index)?;
        self.fetch(path)
    }

    /// プレイリスト上の画像を表示
    ///
    /// 範囲外の位置は無視して `false` を返します。
    pub fn show_index(&self, index: usize) -> bool {
        if index >= self.playlist.len() {
            warn!("プレイリストの範囲外です: {} (全{}件)", index, self.playlist.len());
            return false;
        }

        let image = self.fetch_index(index);
        let shown = image.is_some();
        self.ctx.lock().set_image(image, index);
        shown
    }

    /// 任意のパスの画像を表示
    ///
    /// プレイリスト上の位置は変わりません。
    pub fn show_path(&self, path: &Path) -> bool {
        let image = self.fetch(path);
        let shown = image.is_some();
        let mut state = self.ctx.lock();
        let index = state.index;
        state.set_image(image, index);
        shown
    }

    /// 前後の画像に移動（両端で折り返す）
    pub fn step(&self, step: isize) -> bool {
        if self.playlist.is_empty() {
            return false;
        }
        let current = self.ctx.lock().index;
        self.show_index(self.playlist.wrap(current, step))
    }
}
