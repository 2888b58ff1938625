//! 表示状態モジュール
//!
//! パン・ズーム・回転と表示中の画像を保持する共有状態です。
//! 状態はすべて [`ViewContext`] のロック下で読み書きされ、
//! 描画はロック下で取得したスナップショットに対して行われます。

pub mod navigator;

pub use navigator::Navigator;

use crate::cache::Image;
use log::{debug, error, info};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// 水平方向にクランプするときに残す最小の余白（出力画素）
pub const EDGE_MARGIN: f64 = 10.0;

/// デフォルトのズーム範囲（最大ズームに対する最小ズームの比）
pub const DEFAULT_ZOOM_RANGE: f64 = 16.0;

/// コントラストの初期値（8ビット画像で恒等変換）
pub const DEFAULT_CONTRAST: i32 = 256;

/// 出力領域
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    /// 幅（画素）
    pub width: u32,
    /// 高さ（画素）
    pub height: u32,
    /// 水平オフセット（多画面構成での位置）
    pub x_offset: i32,
    /// 垂直オフセット
    pub y_offset: i32,
}

impl Viewport {
    /// オフセットなしの出力領域を作成
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            x_offset: 0,
            y_offset: 0,
        }
    }
}

/// 選択範囲（出力座標）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelectionZone {
    /// 始点の列
    pub x0: i32,
    /// 始点の行
    pub y0: i32,
    /// 終点の列
    pub x1: i32,
    /// 終点の行
    pub y1: i32,
}

/// 表示調整
///
/// いずれかの値が変わると再描画されます。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplayAdjust {
    /// 明るさ（加算）
    pub luminosity: i32,
    /// コントラスト（乗数、256で恒等）
    pub contrast: i32,
    /// ガンマ
    pub gamma: f32,
    /// 反転
    pub invert: bool,
    /// バイリニア補間
    pub bilinear: bool,
    /// 選択範囲
    pub zone: SelectionZone,
}

impl Default for DisplayAdjust {
    fn default() -> Self {
        Self {
            luminosity: 0,
            contrast: DEFAULT_CONTRAST,
            gamma: 1.0,
            invert: false,
            bilinear: false,
            zone: SelectionZone::default(),
        }
    }
}

/// 変更検出用のキー
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChangeKey {
    z: f64,
    dx: f64,
    dy: f64,
    a: f64,
    adjust: DisplayAdjust,
}

/// 描画用のスナップショット
#[derive(Debug, Clone)]
pub struct ViewSnapshot {
    pub dx: f64,
    pub dy: f64,
    pub z: f64,
    pub a: f64,
    pub image: Option<Arc<Image>>,
    pub adjust: DisplayAdjust,
    pub panorama: bool,
    pub viewport: Viewport,
}

/// 表示状態
#[derive(Debug)]
pub struct ViewState {
    /// 水平方向の平行移動（ソース画素）
    pub dx: f64,
    /// 垂直方向の平行移動（ソース画素）
    pub dy: f64,
    /// ズーム（出力1画素あたりのソース画素数）
    pub z: f64,
    /// 回転（ラジアン）
    pub a: f64,
    /// プレイリスト上の位置
    pub index: usize,
    /// 表示調整
    pub adjust: DisplayAdjust,
    min_zoom: f64,
    max_zoom: f64,
    refresh: bool,
    image: Option<Arc<Image>>,
    viewport: Viewport,
    zoom_range: f64,
    panorama: bool,
}

impl ViewState {
    /// 新しい表示状態を作成
    pub fn new(viewport: Viewport, zoom_range: f64, panorama: bool) -> Self {
        Self {
            dx: 0.0,
            dy: 0.0,
            z: 1.0,
            a: 0.0,
            index: 0,
            adjust: DisplayAdjust::default(),
            min_zoom: 1.0 / zoom_range.max(1.0),
            max_zoom: 1.0,
            refresh: true,
            image: None,
            viewport,
            zoom_range: zoom_range.max(1.0),
            panorama,
        }
    }

    /// 表示中の画像
    pub fn image(&self) -> Option<&Arc<Image>> {
        self.image.as_ref()
    }

    /// 出力領域
    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    /// パノラマモードか
    pub fn is_panorama(&self) -> bool {
        self.panorama
    }

    /// ズームの範囲 (最小, 最大)
    pub fn zoom_limits(&self) -> (f64, f64) {
        (self.min_zoom, self.max_zoom)
    }

    /// 画像を切り替える
    ///
    /// 画像がない場合は黒画面になります。
    pub fn set_image(&mut self, image: Option<Arc<Image>>, index: usize) {
        self.image = image;
        self.index = index;
        self.full_extend();
        self.adjust.contrast = DEFAULT_CONTRAST;
        self.refresh = true;
    }

    /// 画像の高さを出力に合わせ、回転と調整をリセットして中央に表示
    pub fn full_extend(&mut self) {
        self.a = 0.0;
        self.adjust.luminosity = 0;
        self.adjust.gamma = 1.0;
        self.adjust.invert = false;

        let (width, height) = match &self.image {
            Some(image) => (image.width() as f64, image.height() as f64),
            None => return,
        };
        if self.viewport.height == 0 {
            return;
        }

        self.z = height / self.viewport.height as f64;
        self.max_zoom = self.z;
        self.min_zoom = self.max_zoom / self.zoom_range;
        self.center_on(width / 2.0, height / 2.0);
    }

    /// ズームを設定（出力中心を保つ）
    pub fn zoom(&mut self, z: f64) {
        let (cx, cy) = self.center();
        self.z = z.max(self.min_zoom).min(self.max_zoom);
        self.center_on(cx, cy);
    }

    /// 出力画素単位で相対移動
    pub fn translate(&mut self, sx: f64, sy: f64) {
        let (cos, sin) = (self.a.cos(), self.a.sin());
        self.dx += self.z * (cos * sx - sin * sy);
        self.dy += self.z * (sin * sx + cos * sy);
        self.constrain();
    }

    /// 回転角を設定（出力中心を保つ）
    pub fn rotate(&mut self, angle: f64) {
        let (cx, cy) = self.center();
        self.a = angle;
        self.center_on(cx, cy);
    }

    /// ソース座標を出力の中心に表示
    pub fn center_on(&mut self, x: f64, y: f64) {
        let (hx, hy) = self.half_extent();
        self.dx = x - hx;
        self.dy = y - hy;
        self.constrain();
    }

    /// 出力中心に対応するソース座標
    pub fn center(&self) -> (f64, f64) {
        let (hx, hy) = self.half_extent();
        (self.dx + hx, self.dy + hy)
    }

    fn half_extent(&self) -> (f64, f64) {
        let (cos, sin) = (self.a.cos(), self.a.sin());
        let w = self.viewport.width as f64 / 2.0;
        let h = self.viewport.height as f64 / 2.0;
        (self.z * cos * w - self.z * sin * h, self.z * sin * w + self.z * cos * h)
    }

    /// 平行移動を許容範囲に収める
    fn constrain(&mut self) {
        let (width, height) = match &self.image {
            Some(image) => (image.width() as f64, image.height() as f64),
            None => return,
        };
        let (vw, vh) = (self.viewport.width as f64, self.viewport.height as f64);

        if self.dy < 0.0 {
            self.dy = 0.0;
        } else if self.dy > height - vh * self.z {
            self.dy = height - vh * self.z;
        }

        if self.panorama {
            if self.dx > width {
                self.dx -= width;
            } else if self.dx < -width {
                self.dx += width;
            }
        } else {
            if self.dx > width - EDGE_MARGIN {
                self.dx = width - EDGE_MARGIN;
            }
            if self.dx / self.z < -vw + EDGE_MARGIN {
                self.dx = (EDGE_MARGIN - vw) * self.z;
            }
        }
    }

    /// 再描画を要求
    pub fn request_refresh(&mut self) {
        self.refresh = true;
    }

    /// 再描画要求を取り出してクリア
    pub fn take_refresh(&mut self) -> bool {
        std::mem::replace(&mut self.refresh, false)
    }

    /// 変更検出用のキー
    pub fn change_key(&self) -> ChangeKey {
        ChangeKey {
            z: self.z,
            dx: self.dx,
            dy: self.dy,
            a: self.a,
            adjust: self.adjust,
        }
    }

    /// 描画用のスナップショット
    pub fn snapshot(&self) -> ViewSnapshot {
        ViewSnapshot {
            dx: self.dx,
            dy: self.dy,
            z: self.z,
            a: self.a,
            image: self.image.clone(),
            adjust: self.adjust,
            panorama: self.panorama,
            viewport: self.viewport,
        }
    }
}

/// 共有コンテキスト
///
/// 表示状態とそのロック、終了フラグ、最初の致命的エラーを保持します。
pub struct ViewContext {
    state: Mutex<ViewState>,
    running: AtomicBool,
    fatal: Mutex<Option<String>>,
}

impl ViewContext {
    /// 新しいコンテキストを作成
    pub fn new(state: ViewState) -> Self {
        Self {
            state: Mutex::new(state),
            running: AtomicBool::new(true),
            fatal: Mutex::new(None),
        }
    }

    /// 状態ロックを取得
    pub fn lock(&self) -> MutexGuard<'_, ViewState> {
        self.state.lock()
    }

    /// 実行中か
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 終了を要求
    pub fn request_shutdown(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("終了が要求されました");
        }
    }

    /// 致命的エラーを記録して終了を要求
    ///
    /// 最初のエラーだけが保持されます。
    pub fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        error!("致命的なエラー: {}", message);
        {
            let mut fatal = self.fatal.lock();
            if fatal.is_none() {
                *fatal = Some(message);
            } else {
                debug!("先行する致命的エラーがあるため記録しません");
            }
        }
        self.request_shutdown();
    }

    /// 記録された致命的エラー
    pub fn fatal_error(&self) -> Option<String> {
        self.fatal.lock().clone()
    }
}
