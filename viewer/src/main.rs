//! パノラマビューアのエントリポイント

use anyhow::{bail, Context};
use clap::Parser;
use pano_view_rs_viewer::config::ViewerSettings;
use pano_view_rs_viewer::network::SlaveDescriptor;
use pano_view_rs_viewer::playlist::Playlist;
use pano_view_rs_viewer::render::{shared_presenter, HeadlessPresenter};
use pano_view_rs_viewer::App;
use std::path::PathBuf;
use std::process;

/// コマンドライン引数
#[derive(Parser, Debug)]
#[command(name = "pano-viewer", version, about = "パノラマ画像ビューア")]
struct Cli {
    /// 表示する画像ファイル
    files: Vec<PathBuf>,

    /// 設定ファイル（.toml / .json）
    #[arg(long)]
    config: Option<PathBuf>,

    /// 出力ジオメトリ（WxH+X+Y）
    #[arg(short, long)]
    geometry: Option<String>,

    /// 描画スレッド数
    #[arg(short, long)]
    threads: Option<usize>,

    /// キャッシュのスロット数
    #[arg(long)]
    cache: Option<usize>,

    /// バイリニア補間を使う
    #[arg(long)]
    bilinear: bool,

    /// パノラマモード（水平方向に折り返す）
    #[arg(long)]
    panorama: bool,

    /// ズーム範囲
    #[arg(long)]
    max_zoom: Option<f64>,

    /// コマンドを読む名前付きパイプ
    #[arg(long)]
    fifo: Option<PathBuf>,

    /// スレーブとして待ち受けるアドレス
    #[arg(long)]
    listen_addr: Option<String>,

    /// スレーブとして待ち受けるポート
    #[arg(long)]
    listen_port: Option<u16>,

    /// 参加するマルチキャストグループ
    #[arg(long)]
    multicast: Option<String>,

    /// 同期先のスレーブ（host:port、複数指定可）
    #[arg(long = "slave")]
    slaves: Vec<String>,

    /// ブロードキャストで同期するスレーブ（host:port）
    #[arg(long = "broadcast-slave")]
    broadcast_slaves: Vec<String>,

    /// 指定ファイルのディレクトリを展開する
    #[arg(long)]
    browse: bool,

    /// 順序をランダムにする
    #[arg(long)]
    shuffle: bool,

    /// 読み込み失敗時に表示する画像
    #[arg(long)]
    default_image: Option<PathBuf>,

    /// EXIF の向きによる自動回転を無効にする
    #[arg(long)]
    no_autorotate: bool,

    /// 詳細なログを出力
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    /// 設定ファイルにコマンドライン引数を上書き
    fn settings(&self) -> anyhow::Result<ViewerSettings> {
        let path = self.config.clone().unwrap_or_else(ViewerSettings::default_path);
        let mut settings = ViewerSettings::load(&path)
            .with_context(|| format!("設定の読み込みに失敗しました: {}", path.display()))?;

        if let Some(geometry) = &self.geometry {
            settings.display.apply_geometry(geometry)?;
        }
        if let Some(threads) = self.threads {
            settings.render.threads = Some(threads);
        }
        if let Some(capacity) = self.cache {
            settings.cache.capacity = capacity;
        }
        if let Some(range) = self.max_zoom {
            settings.render.zoom_range = range;
        }
        settings.render.bilinear |= self.bilinear;
        settings.render.panorama |= self.panorama;
        settings.playlist.browse |= self.browse;
        settings.playlist.shuffle |= self.shuffle;
        if self.no_autorotate {
            settings.cache.autorotate = false;
        }

        if self.fifo.is_some() {
            settings.command.fifo = self.fifo.clone();
        }
        if self.default_image.is_some() {
            settings.cache.default_image = self.default_image.clone();
        }
        if self.listen_addr.is_some() {
            settings.sync.listen_addr = self.listen_addr.clone();
        }
        if self.listen_port.is_some() {
            settings.sync.listen_port = self.listen_port;
        }
        if self.multicast.is_some() {
            settings.sync.multicast = self.multicast.clone();
        }
        for spec in &self.slaves {
            settings.sync.slaves.push(SlaveDescriptor::parse(spec, false)?);
        }
        for spec in &self.broadcast_slaves {
            settings.sync.slaves.push(SlaveDescriptor::parse(spec, true)?);
        }

        Ok(settings)
    }

    /// プレイリストと開始位置を作る
    fn playlist(&self, settings: &ViewerSettings) -> anyhow::Result<(Playlist, usize)> {
        let (mut playlist, start) = if settings.playlist.browse {
            match self.files.as_slice() {
                [file] => Playlist::browse(file)
                    .with_context(|| format!("ディレクトリを読めません: {}", file.display()))?,
                _ => bail!("--browse にはファイルを1つだけ指定してください"),
            }
        } else {
            (Playlist::new(self.files.clone()), 0)
        };

        if settings.playlist.shuffle {
            playlist.shuffle(&mut rand::thread_rng());
            return Ok((playlist, 0));
        }
        Ok((playlist, start))
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = cli.settings()?;
    let (playlist, start) = cli.playlist(&settings)?;
    log::info!("プレイリスト: {} 件", playlist.len());

    if !settings.display.headless {
        log::warn!("ウィンドウ出力は外部の表示先が必要です。ヘッドレスで描画します");
    }

    let presenter = shared_presenter(HeadlessPresenter::new());
    let mut app = App::new(settings, playlist, start, presenter)?;
    app.run()?;
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    // ロガーを初期化
    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .init();

    // パニックハンドラを設定（未処理のパニックをログに記録）
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("ビューアでパニックが発生しました: {:?}", panic_info);
        log::error!("ビューアでパニックが発生しました: {:?}", panic_info);
    }));

    if let Err(e) = run(cli) {
        eprintln!("ビューアの実行中にエラーが発生しました: {:#}", e);
        log::error!("ビューアの実行中にエラーが発生しました: {:#}", e);
        process::exit(1);
    }
}
