//! ビューアアプリケーション
//!
//! 設定から各コンポーネントを組み立て、長寿命スレッドを起動・停止します。

use crate::cache::{FallbackDecoder, ImageCache, Preloader};
use crate::command::{self, CommandChannel};
use crate::config::ViewerSettings;
use crate::error::{Result, ViewerError};
use crate::network::{SyncMaster, SyncRole, SyncSlave};
use crate::playlist::Playlist;
use crate::render::{IdleBackoff, RenderLoop, SharedPresenter, TileScheduler};
use crate::view::{Navigator, ViewContext, ViewState, Viewport};

use log::{debug, error, info, warn};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// 終了フラグを確認する間隔
const SUPERVISE_INTERVAL: Duration = Duration::from_millis(50);

/// アプリケーション状態
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum AppState {
    /// 準備完了
    Ready,
    /// 実行中
    Running,
    /// 停止済み
    Stopped,
}

/// アプリケーション
pub struct App {
    /// アプリケーション状態
    state: AppState,
    /// 設定
    settings: ViewerSettings,
    /// 共有コンテキスト
    ctx: Arc<ViewContext>,
    /// 画像キャッシュ
    cache: Arc<ImageCache>,
    /// 画像ナビゲータ
    navigator: Arc<Navigator>,
    /// 表示先
    presenter: SharedPresenter,
    /// 同期の役割
    role: SyncRole,
    /// 最初に表示する位置
    start_index: usize,
    /// 停止時に合流するスレッド
    handles: Vec<JoinHandle<()>>,
    /// 開いているコマンドチャネルのパイプと、自分で作成したかどうか
    fifo: Option<(PathBuf, bool)>,
}

impl App {
    /// 新しいアプリケーションを作成
    pub fn new(settings: ViewerSettings, playlist: Playlist, start_index: usize, presenter: SharedPresenter) -> Result<Self> {
        let role = settings.role()?;
        let decoder = FallbackDecoder::new().with_autorotate(settings.cache.autorotate);
        let cache = Arc::new(ImageCache::new(settings.cache.capacity, Arc::new(decoder))?);

        let display = &settings.display;
        let viewport = Viewport {
            width: display.width,
            height: display.height,
            x_offset: display.x_offset,
            y_offset: display.y_offset,
        };
        let mut state = ViewState::new(viewport, settings.render.zoom_range, settings.render.panorama);
        state.adjust.bilinear = settings.render.bilinear;
        let ctx = Arc::new(ViewContext::new(state));

        let navigator = Arc::new(Navigator::new(
            ctx.clone(),
            cache.clone(),
            Arc::new(playlist),
            settings.cache.default_image.clone(),
        ));

        Ok(Self {
            state: AppState::Ready,
            settings,
            ctx,
            cache,
            navigator,
            presenter,
            role,
            start_index,
            handles: Vec::new(),
            fifo: None,
        })
    }

    /// アプリケーション状態
    pub fn state(&self) -> AppState {
        self.state
    }

    /// 共有コンテキスト
    pub fn context(&self) -> &Arc<ViewContext> {
        &self.ctx
    }

    /// 画像ナビゲータ
    pub fn navigator(&self) -> &Arc<Navigator> {
        &self.navigator
    }

    /// 各スレッドを起動
    ///
    /// 同期ソケットのバインドとフレームの確保はここで行い、失敗は呼び出し元に返します。
    pub fn start(&mut self) -> Result<()> {
        if self.state != AppState::Ready {
            return Ok(());
        }
        info!("ビューアを起動します（同期: {}）", self.role.name());

        let playlist = self.navigator.playlist().clone();
        if playlist.is_empty() {
            warn!("表示する画像がありません");
        } else {
            self.navigator.show_index(self.start_index.min(playlist.len() - 1));
        }

        // 描画
        let scheduler = match self.settings.render.threads {
            Some(threads) => TileScheduler::new(threads),
            None => TileScheduler::detect(),
        };
        let render = &self.settings.render;
        let backoff = IdleBackoff::new(
            Duration::from_millis(render.idle_min_ms),
            Duration::from_millis(render.idle_max_ms),
            render.idle_growth,
        );
        let mut render_loop = RenderLoop::new(self.ctx.clone(), scheduler, self.presenter.clone(), backoff)?;
        self.spawn("render", move || render_loop.run().map_err(ViewerError::from))?;

        // 先読み
        let preloader = Preloader::new(
            self.ctx.clone(),
            self.cache.clone(),
            playlist,
            Duration::from_millis(self.settings.cache.preload_interval_ms),
        );
        self.spawn("preload", move || {
            preloader.run();
            Ok(())
        })?;

        // 同期
        match self.role.clone() {
            SyncRole::None => {},
            SyncRole::Master { slaves } => {
                let mut master = SyncMaster::new(slaves, &self.ctx)?;
                let ctx = self.ctx.clone();
                self.spawn("sync-master", move || master.run(&ctx).map_err(ViewerError::from))?;
            },
            SyncRole::Slave {
                listen_addr,
                port,
                multicast,
            } => {
                let slave = SyncSlave::bind(listen_addr, port, multicast)?;
                let ctx = self.ctx.clone();
                let navigator = self.navigator.clone();
                self.spawn("sync-slave", move || slave.run(&ctx, &navigator).map_err(ViewerError::from))?;
            },
        }

        // コマンドチャネル（読み込み中はブロックするので合流しない）
        if let Some(fifo) = self.settings.command.fifo.clone() {
            let created = command::prepare_fifo(&fifo)?;
            self.fifo = Some((fifo.clone(), created));
            let channel = CommandChannel::new(self.ctx.clone(), self.navigator.clone());
            let ctx = self.ctx.clone();
            thread::Builder::new().name("command".to_string()).spawn(move || {
                if let Err(e) = channel.run_fifo(&fifo) {
                    warn!("コマンドチャネルを読めません: {}: {}", fifo.display(), e);
                }
                debug!("コマンドチャネルを閉じました（実行中: {}）", ctx.is_running());
            })?;
        }

        self.state = AppState::Running;
        Ok(())
    }

    /// 名前付きスレッドを起動
    ///
    /// スレッドがエラーを返した場合は致命的エラーとして記録します。
    fn spawn<F>(&mut self, name: &str, task: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let ctx = self.ctx.clone();
        let label = name.to_string();
        let handle = thread::Builder::new().name(label.clone()).spawn(move || {
            if let Err(e) = task() {
                error!("{} スレッドが異常終了しました", label);
                ctx.fail(e.to_string());
            }
        })?;
        self.handles.push(handle);
        Ok(())
    }

    /// 終了要求まで実行
    pub fn run(&mut self) -> Result<()> {
        if let Err(e) = self.start() {
            self.shutdown();
            return Err(e);
        }

        while self.ctx.is_running() {
            thread::sleep(SUPERVISE_INTERVAL);
        }
        self.shutdown();

        match self.ctx.fatal_error() {
            Some(message) => Err(ViewerError::Fatal(message)),
            None => Ok(()),
        }
    }

    /// 停止
    ///
    /// スレッドと合流してからキャッシュを解放します。
    pub fn shutdown(&mut self) {
        if self.state == AppState::Stopped {
            return;
        }
        info!("ビューアを停止します");
        self.ctx.request_shutdown();

        for handle in self.handles.drain(..) {
            let name = handle.thread().name().unwrap_or("unnamed").to_string();
            if handle.join().is_err() {
                warn!("{} スレッドがパニックしました", name);
            }
        }

        if let Some((fifo, created)) = self.fifo.take() {
            command::wake_reader(&fifo);
            if created {
                match fs::remove_file(&fifo) {
                    Ok(()) => debug!("名前付きパイプを削除しました: {}", fifo.display()),
                    Err(e) => warn!("名前付きパイプを削除できません: {}: {}", fifo.display(), e),
                }
            }
        }

        self.cache.clear();
        self.state = AppState::Stopped;
        info!("ビューアを停止しました");
    }
}

impl Drop for App {
    fn drop(&mut self) {
        self.shutdown();
    }
}
