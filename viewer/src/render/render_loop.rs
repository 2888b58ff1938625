//! 描画ループ
//!
//! 表示状態の変化を検出したときだけフレームを生成して表示します。
//! 変化がない間は待機時間を少しずつ伸ばします。

use crate::render::scheduler::TileScheduler;
use crate::render::transform::Radiometry;
use crate::render::{FrameBuffer, RenderError, SharedPresenter};
use crate::view::{ChangeKey, ViewContext};
use log::{debug, trace};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// 適応的な待機時間
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IdleBackoff {
    min: Duration,
    max: Duration,
    factor: f64,
    current: Duration,
}

impl IdleBackoff {
    /// 新しい待機時間を作成
    pub fn new(min: Duration, max: Duration, factor: f64) -> Self {
        Self {
            min,
            max: max.max(min),
            factor: factor.max(1.0),
            current: min,
        }
    }

    /// 現在の待機時間
    pub fn current(&self) -> Duration {
        self.current
    }

    /// 最短に戻す
    pub fn reset(&mut self) {
        self.current = self.min;
    }

    /// 待機時間を伸ばして返す
    pub fn grow(&mut self) -> Duration {
        self.current = self.current.mul_f64(self.factor).min(self.max);
        self.current
    }
}

impl Default for IdleBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_millis(200), 1.02)
    }
}

/// 1回のループの結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStep {
    /// フレームを表示した
    Rendered,
    /// 変化なし（待機時間）
    Idle(Duration),
}

/// 描画ループ
pub struct RenderLoop {
    ctx: Arc<ViewContext>,
    scheduler: TileScheduler,
    presenter: SharedPresenter,
    frame: FrameBuffer,
    radiometry: Radiometry,
    /// 前回描画したときの状態
    shadow: Option<ChangeKey>,
    backoff: IdleBackoff,
}

impl RenderLoop {
    /// 新しい描画ループを作成
    ///
    /// 出力領域の大きさでフレームを確保します。
    pub fn new(
        ctx: Arc<ViewContext>,
        scheduler: TileScheduler,
        presenter: SharedPresenter,
        backoff: IdleBackoff,
    ) -> Result<Self, RenderError> {
        let viewport = ctx.lock().viewport();
        let frame = FrameBuffer::new(viewport.width, viewport.height)?;

        Ok(Self {
            ctx,
            scheduler,
            presenter,
            frame,
            radiometry: Radiometry::new(),
            shadow: None,
            backoff,
        })
    }

    /// 現在の待機時間
    pub fn backoff(&self) -> &IdleBackoff {
        &self.backoff
    }

    /// 1回分の処理
    pub fn step(&mut self) -> Result<LoopStep, RenderError> {
        let snapshot = {
            let mut state = self.ctx.lock();
            let key = state.change_key();
            let refresh = state.take_refresh();
            if !refresh && self.shadow == Some(key) {
                None
            } else {
                self.shadow = Some(key);
                Some(state.snapshot())
            }
        };

        let snapshot = match snapshot {
            Some(snapshot) => snapshot,
            None => return Ok(LoopStep::Idle(self.backoff.grow())),
        };

        if self.radiometry.update(snapshot.adjust.gamma) {
            debug!("ガンマ表を更新しました: {}", snapshot.adjust.gamma);
        }
        self.scheduler.fill(&mut self.frame, &snapshot, &self.radiometry);
        self.presenter.lock().present(&self.frame)?;
        self.backoff.reset();

        trace!("フレームを表示しました (z={:.4}, dx={:.1}, dy={:.1}, a={:.3})", snapshot.z, snapshot.dx, snapshot.dy, snapshot.a);
        Ok(LoopStep::Rendered)
    }

    /// 終了まで描画を続ける
    pub fn run(&mut self) -> Result<(), RenderError> {
        debug!("描画ループを開始します（ワーカー数: {}）", self.scheduler.workers());
        while self.ctx.is_running() {
            if let LoopStep::Idle(delay) = self.step()? {
                thread::sleep(delay);
            }
        }
        debug!("描画ループを終了しました");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::{shared_presenter, HeadlessPresenter};
    use crate::test_support::gradient_image;
    use crate::view::{ViewState, Viewport, DEFAULT_ZOOM_RANGE};

    fn render_loop() -> (Arc<ViewContext>, HeadlessPresenter, RenderLoop) {
        let mut state = ViewState::new(Viewport::new(16, 8), DEFAULT_ZOOM_RANGE, false);
        state.set_image(Some(gradient_image(32, 16)), 0);
        let ctx = Arc::new(ViewContext::new(state));
        let presenter = HeadlessPresenter::new();
        let render = RenderLoop::new(ctx.clone(), TileScheduler::new(2), shared_presenter(presenter.clone()), IdleBackoff::default()).unwrap();
        (ctx, presenter, render)
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = IdleBackoff::default();
        assert_eq!(backoff.current(), Duration::from_millis(5));

        let first = backoff.grow();
        assert!(first > Duration::from_millis(5));
        assert!(first < Duration::from_millis(6));

        for _ in 0..1000 {
            backoff.grow();
        }
        assert_eq!(backoff.current(), Duration::from_millis(200));

        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_millis(5));
    }

    #[test]
    fn test_renders_once_then_idles() {
        let (_, presenter, mut render) = render_loop();

        assert_eq!(render.step().unwrap(), LoopStep::Rendered);
        assert!(matches!(render.step().unwrap(), LoopStep::Idle(_)));
        assert!(matches!(render.step().unwrap(), LoopStep::Idle(_)));

        assert_eq!(presenter.frames_presented(), 1);
        assert!(render.backoff().current() > Duration::from_millis(5));
    }

    #[test]
    fn test_state_change_triggers_render() {
        let (ctx, presenter, mut render) = render_loop();
        render.step().unwrap();
        render.step().unwrap();

        ctx.lock().zoom(1.0);

        assert_eq!(render.step().unwrap(), LoopStep::Rendered);
        assert_eq!(render.backoff().current(), Duration::from_millis(5));
        assert_eq!(presenter.frames_presented(), 2);
    }

    #[test]
    fn test_adjustment_and_refresh_trigger_render() {
        let (ctx, presenter, mut render) = render_loop();
        render.step().unwrap();

        ctx.lock().adjust.invert = true;
        assert_eq!(render.step().unwrap(), LoopStep::Rendered);

        ctx.lock().request_refresh();
        assert_eq!(render.step().unwrap(), LoopStep::Rendered);

        assert!(matches!(render.step().unwrap(), LoopStep::Idle(_)));
        assert_eq!(presenter.frames_presented(), 3);
    }

    #[test]
    fn test_presented_frame_shows_image() {
        let (ctx, presenter, mut render) = render_loop();
        ctx.lock().zoom(1.0);
        let (dx, dy) = {
            let state = ctx.lock();
            (state.dx as usize, state.dy as usize)
        };

        render.step().unwrap();

        let frame = presenter.last_frame().unwrap();
        let expected = gradient_image(32, 16).rgb(dy + 2, dx + 3);
        assert_eq!(frame.pixel(2, 3), [expected[0] as u8, expected[1] as u8, expected[2] as u8]);
    }
}
