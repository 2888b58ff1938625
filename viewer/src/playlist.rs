//! プレイリスト
//!
//! 表示する画像パスの順序付きリストです。
//! 同期するビューア同士は同じ順序のリストを持つ必要があります。

use log::debug;
use rand::seq::SliceRandom;
use rand::Rng;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// プレイリスト
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Playlist {
    entries: Vec<PathBuf>,
}

impl Playlist {
    /// パスの一覧から作成
    pub fn new(entries: Vec<PathBuf>) -> Self {
        Self { entries }
    }

    /// ディレクトリを展開してプレイリストを作成
    ///
    /// ファイルを指定した場合はその親ディレクトリの内容を展開し、
    /// 開始位置として指定ファイルの位置を返します。
    pub fn browse(path: &Path) -> io::Result<(Self, usize)> {
        let (dir, start) = if path.is_dir() {
            (path.to_path_buf(), None)
        } else {
            let parent = match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                _ => PathBuf::from("."),
            };
            (parent, path.file_name().map(|name| name.to_os_string()))
        };

        let mut entries = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            if !hidden && entry.file_type()?.is_file() {
                entries.push(entry.path());
            }
        }
        entries.sort();

        let index = start
            .and_then(|name| entries.iter().position(|entry| entry.file_name() == Some(name.as_os_str())))
            .unwrap_or(0);

        debug!("{} から {} 件のファイルを読み込みました", dir.display(), entries.len());
        Ok((Self { entries }, index))
    }

    /// 順序をランダムに並べ替える
    pub fn shuffle<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.entries.shuffle(rng);
    }

    /// 件数
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// 空かどうか
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 指定位置のパス
    pub fn get(&self, index: usize) -> Option<&Path> {
        self.entries.get(index).map(PathBuf::as_path)
    }

    /// すべてのパス
    pub fn entries(&self) -> &[PathBuf] {
        &self.entries
    }

    /// 位置を両端で折り返して移動
    pub fn wrap(&self, index: usize, step: isize) -> usize {
        if self.entries.is_empty() {
            return 0;
        }
        (index as isize + step).rem_euclid(self.entries.len() as isize) as usize
    }
}
