//! コマンドチャネル
//!
//! 名前付きパイプなどから1行1コマンドのテキストを読み、表示状態を操作します。
//! 解釈できない行は無視します。

use crate::view::{Navigator, ViewContext};
use log::{debug, info};
use pano_view_rs_common::ViewerCommand;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// パイプを開き直すまでの待機時間
const REOPEN_DELAY: Duration = Duration::from_millis(50);

/// コマンドチャネル
pub struct CommandChannel {
    ctx: Arc<ViewContext>,
    navigator: Arc<Navigator>,
}

impl CommandChannel {
    /// 新しいコマンドチャネルを作成
    pub fn new(ctx: Arc<ViewContext>, navigator: Arc<Navigator>) -> Self {
        Self { ctx, navigator }
    }

    /// コマンドを実行
    pub fn execute(&self, command: &ViewerCommand) {
        debug!("コマンドを実行します: {}", command);
        match command {
            ViewerCommand::Load { path } => {
                self.navigator.show_path(path);
            },
            ViewerCommand::Zoom { level } => {
                let mut state = self.ctx.lock();
                if *level <= 0.0 {
                    state.full_extend();
                } else {
                    state.zoom(*level as f64);
                }
            },
            ViewerCommand::Center { x, y } => self.ctx.lock().center_on(*x as f64, *y as f64),
            ViewerCommand::Move { dx, dy } => self.ctx.lock().translate(*dx as f64, *dy as f64),
            ViewerCommand::Quit => {
                info!("終了コマンドを受信しました");
                self.ctx.request_shutdown();
            },
        }
    }

    /// 1行を処理
    ///
    /// 実行した場合は `true` を返します。
    pub fn process_line(&self, line: &str) -> bool {
        if line.trim().is_empty() {
            return false;
        }
        match ViewerCommand::parse(line) {
            Ok(command) => {
                self.execute(&command);
                true
            },
            Err(e) => {
                debug!("コマンドを無視します: {}", e);
                false
            },
        }
    }

    /// 読み取り元が終わるか終了要求があるまで処理
    ///
    /// 実行したコマンド数を返します。
    pub fn process<R: BufRead>(&self, reader: R) -> io::Result<usize> {
        let mut executed = 0;
        for line in reader.lines() {
            if !self.ctx.is_running() {
                break;
            }
            if self.process_line(&line?) {
                executed += 1;
            }
        }
        Ok(executed)
    }

    /// パイプから読み続ける
    ///
    /// 書き込み側が閉じるたびに開き直します。通常のファイルは一度だけ読みます。
    pub fn run_fifo(&self, path: &Path) -> io::Result<()> {
        let fifo = is_fifo(path)?;
        info!("コマンドチャネルを開きます: {}", path.display());

        while self.ctx.is_running() {
            // 書き込み側が現れるまでブロックする
            let file = File::open(path)?;
            let executed = self.process(BufReader::new(file))?;
            debug!("コマンドを{}件処理しました", executed);

            if !fifo {
                break;
            }
            thread::sleep(REOPEN_DELAY);
        }
        Ok(())
    }
}

/// コマンドチャネル用のパイプを用意
///
/// パスが存在しなければ名前付きパイプ（モード 0700）を作成し、作成した場合は `true` を返します。
pub fn prepare_fifo(path: &Path) -> io::Result<bool> {
    if fs::symlink_metadata(path).is_ok() {
        return Ok(false);
    }
    create_fifo(path)?;
    info!("名前付きパイプを作成しました: {}", path.display());
    Ok(true)
}

#[cfg(unix)]
fn create_fifo(path: &Path) -> io::Result<()> {
    use nix::sys::stat::Mode;
    nix::unistd::mkfifo(path, Mode::S_IRWXU).map_err(io::Error::from)
}

#[cfg(not(unix))]
fn create_fifo(path: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("名前付きパイプを作成できません: {}", path.display()),
    ))
}

/// パイプを開く待ちでブロックしている読み手を起こす
///
/// 読み手がいなければ何もしません。
#[cfg(unix)]
pub fn wake_reader(path: &Path) {
    use nix::fcntl::OFlag;
    use std::os::unix::fs::OpenOptionsExt;

    if let Ok(writer) = fs::OpenOptions::new().write(true).custom_flags(OFlag::O_NONBLOCK.bits()).open(path) {
        drop(writer);
        debug!("コマンドチャネルの読み手を起こしました");
    }
}

#[cfg(not(unix))]
pub fn wake_reader(_path: &Path) {}

#[cfg(unix)]
fn is_fifo(path: &Path) -> io::Result<bool> {
    use std::os::unix::fs::FileTypeExt;
    Ok(fs::metadata(path)?.file_type().is_fifo())
}

#[cfg(not(unix))]
fn is_fifo(path: &Path) -> io::Result<bool> {
    if !fs::metadata(path)?.is_file() {
        log::warn!("パイプとして扱えません: {}", path.display());
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ImageCache;
    use crate::playlist::Playlist;
    use crate::test_support::CountingDecoder;
    use crate::view::{ViewState, Viewport, DEFAULT_ZOOM_RANGE};
    use std::io::{Cursor, Write};
    use std::path::PathBuf;

    fn channel() -> (Arc<ViewContext>, CommandChannel) {
        let ctx = Arc::new(ViewContext::new(ViewState::new(Viewport::new(100, 50), DEFAULT_ZOOM_RANGE, false)));
        let cache = Arc::new(ImageCache::new(5, Arc::new(CountingDecoder::new(400, 200))).unwrap());
        let playlist = Arc::new(Playlist::new(vec![PathBuf::from("first.ppm")]));
        let navigator = Arc::new(Navigator::new(ctx.clone(), cache, playlist, None));
        navigator.show_index(0);
        (ctx.clone(), CommandChannel::new(ctx, navigator))
    }

    #[test]
    fn test_zoom_center_move() {
        let (ctx, channel) = channel();

        assert!(channel.process_line("z 1"));
        assert_eq!(ctx.lock().z, 1.0);

        assert!(channel.process_line("c 150 80"));
        assert_eq!(ctx.lock().center(), (150.0, 80.0));

        assert!(channel.process_line("m 5 -10"));
        let state = ctx.lock();
        assert_eq!((state.dx, state.dy), (105.0, 45.0));
    }

    #[test]
    fn test_non_positive_zoom_fits_window() {
        let (ctx, channel) = channel();
        channel.process_line("z 1");

        channel.process_line("z 0");

        assert_eq!(ctx.lock().z, 4.0);
    }

    #[test]
    fn test_load_switches_image() {
        let (ctx, channel) = channel();

        assert!(channel.process_line("l /data/other pano.ppm"));

        let state = ctx.lock();
        assert_eq!(state.image().map(|i| i.path().to_path_buf()), Some(PathBuf::from("/data/other pano.ppm")));
        assert_eq!(state.index, 0);
    }

    #[test]
    fn test_malformed_lines_are_ignored() {
        let (ctx, channel) = channel();
        let before = ctx.lock().change_key();

        for line in ["zoom 2", "z", "c 1", "m a b", "", "x"] {
            assert!(!channel.process_line(line));
        }

        assert_eq!(ctx.lock().change_key(), before);
        assert!(ctx.is_running());
    }

    #[test]
    fn test_quit_stops_processing() {
        let (ctx, channel) = channel();
        let input = Cursor::new("z 2\nq\nz 1\n");

        let executed = channel.process(input).unwrap();

        assert_eq!(executed, 2);
        assert!(!ctx.is_running());
        assert_eq!(ctx.lock().z, 2.0);
    }

    #[test]
    fn test_run_fifo_reads_regular_file_once() {
        let (ctx, channel) = channel();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("commands");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "z 2").unwrap();
        writeln!(file, "bogus").unwrap();
        writeln!(file, "m 10 0").unwrap();
        drop(file);

        channel.run_fifo(&path).unwrap();

        assert!(ctx.is_running());
        assert_eq!(ctx.lock().z, 2.0);
    }

    #[cfg(unix)]
    #[test]
    fn test_prepare_fifo_creates_missing_pipe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("commands.fifo");

        assert!(prepare_fifo(&path).unwrap());
        assert!(is_fifo(&path).unwrap());
        assert!(!prepare_fifo(&path).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_run_fifo_reads_until_quit() {
        let (ctx, channel) = channel();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("commands.fifo");
        prepare_fifo(&path).unwrap();

        let writer_path = path.clone();
        let writer = thread::spawn(move || {
            let mut pipe = fs::OpenOptions::new().write(true).open(&writer_path).unwrap();
            pipe.write_all(b"z 2\nq\n").unwrap();
        });

        channel.run_fifo(&path).unwrap();
        writer.join().unwrap();

        assert!(!ctx.is_running());
        assert_eq!(ctx.lock().z, 2.0);
    }
}
