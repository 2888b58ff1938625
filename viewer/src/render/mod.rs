//! 描画モジュール
//!
//! 表示状態のスナップショットから出力フレームを生成し、
//! 表示先（[`Presenter`]）に渡します。

pub mod render_loop;
pub mod scheduler;
pub mod transform;

// 主要なコンポーネントを再エクスポート
pub use render_loop::{IdleBackoff, LoopStep, RenderLoop};
pub use scheduler::TileScheduler;
pub use transform::{Radiometry, TransformEngine, OUTSIDE_COLOR};

use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

/// 出力1画素あたりのバイト数（RGBA）
pub const BYTES_PER_PIXEL: usize = 4;

/// 描画エラー
#[derive(Error, Debug)]
pub enum RenderError {
    /// フレームバッファを確保できない
    #[error("フレームバッファを確保できません: {width}x{height}")]
    Allocation {
        /// 幅
        width: u32,
        /// 高さ
        height: u32,
    },

    /// 表示の失敗
    #[error("表示に失敗しました: {0}")]
    Presentation(String),
}

/// 出力フレーム
///
/// 行優先の RGBA で、アルファは常に 255 です。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBuffer {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl FrameBuffer {
    /// 黒で初期化したフレームを確保
    pub fn new(width: u32, height: u32) -> Result<Self, RenderError> {
        let alloc_error = || RenderError::Allocation { width, height };
        let len = (width as usize)
            .checked_mul(height as usize)
            .and_then(|pixels| pixels.checked_mul(BYTES_PER_PIXEL))
            .ok_or_else(alloc_error)?;

        let mut data = Vec::new();
        data.try_reserve_exact(len).map_err(|_| alloc_error())?;
        data.resize(len, 0);

        let mut frame = Self { width, height, data };
        frame.clear();
        Ok(frame)
    }

    /// 幅
    pub fn width(&self) -> u32 {
        self.width
    }

    /// 高さ
    pub fn height(&self) -> u32 {
        self.height
    }

    /// 画素データ
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// 画素データ（書き込み用）
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// 1行のバイト数
    pub fn stride(&self) -> usize {
        self.width as usize * BYTES_PER_PIXEL
    }

    /// 指定画素の RGB
    pub fn pixel(&self, row: usize, col: usize) -> [u8; 3] {
        let offset = row * self.stride() + col * BYTES_PER_PIXEL;
        [self.data[offset], self.data[offset + 1], self.data[offset + 2]]
    }

    /// 黒で塗りつぶす
    pub fn clear(&mut self) {
        for pixel in self.data.chunks_exact_mut(BYTES_PER_PIXEL) {
            pixel.copy_from_slice(&[0, 0, 0, 255]);
        }
    }
}

/// 表示先
///
/// ウィンドウシステムへの出力はこのトレイトを実装して差し込みます。
pub trait Presenter: Send {
    /// フレームを表示
    fn present(&mut self, frame: &FrameBuffer) -> Result<(), RenderError>;
}

/// 表示ロックで保護された表示先
pub type SharedPresenter = Arc<Mutex<Box<dyn Presenter>>>;

/// 表示先を表示ロックで包む
pub fn shared_presenter<P: Presenter + 'static>(presenter: P) -> SharedPresenter {
    Arc::new(Mutex::new(Box::new(presenter)))
}

#[derive(Debug, Default)]
struct HeadlessState {
    frames: u64,
    last: Option<FrameBuffer>,
}

/// ウィンドウを持たない表示先
///
/// 表示回数と最後のフレームだけを記録します。複製は状態を共有します。
#[derive(Debug, Clone, Default)]
pub struct HeadlessPresenter {
    inner: Arc<Mutex<HeadlessState>>,
}

impl HeadlessPresenter {
    /// 新しい表示先を作成
    pub fn new() -> Self {
        Self::default()
    }

    /// 表示したフレーム数
    pub fn frames_presented(&self) -> u64 {
        self.inner.lock().frames
    }

    /// 最後に表示したフレーム
    pub fn last_frame(&self) -> Option<FrameBuffer> {
        self.inner.lock().last.clone()
    }
}

impl Presenter for HeadlessPresenter {
    fn present(&mut self, frame: &FrameBuffer) -> Result<(), RenderError> {
        let mut inner = self.inner.lock();
        inner.frames += 1;
        match &mut inner.last {
            Some(last) if last.data.len() == frame.data.len() => {
                last.data.copy_from_slice(&frame.data);
                last.width = frame.width;
                last.height = frame.height;
            },
            slot => *slot = Some(frame.clone()),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_frame_is_opaque_black() {
        let frame = FrameBuffer::new(3, 2).unwrap();

        assert_eq!(frame.data().len(), 3 * 2 * BYTES_PER_PIXEL);
        assert_eq!(frame.pixel(1, 2), [0, 0, 0]);
        assert!(frame.data().chunks_exact(4).all(|p| p[3] == 255));
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        assert!(matches!(
            FrameBuffer::new(u32::MAX, u32::MAX),
            Err(RenderError::Allocation { .. })
        ));
    }

    #[test]
    fn test_headless_presenter_records_frames() {
        let presenter = HeadlessPresenter::new();
        let shared = shared_presenter(presenter.clone());
        let mut frame = FrameBuffer::new(2, 2).unwrap();

        shared.lock().present(&frame).unwrap();
        frame.data_mut()[0] = 99;
        shared.lock().present(&frame).unwrap();

        assert_eq!(presenter.frames_presented(), 2);
        assert_eq!(presenter.last_frame().map(|f| f.pixel(0, 0)), Some([99, 0, 0]));
    }
}
