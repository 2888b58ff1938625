//! 同期スレーブ
//!
//! マスターから届いた同期メッセージを表示状態に反映します。
//! 範囲外のインデックスはプレイリストの不一致とみなし、致命的エラーにします。

use crate::network::NetworkError;
use crate::view::{Navigator, ViewContext};
use log::{debug, info, warn};
use pano_view_rs_common::SyncMessage;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;

/// 受信タイムアウト（終了フラグを確認する間隔）
pub const RECEIVE_TIMEOUT: Duration = Duration::from_millis(200);

/// 同期スレーブ
pub struct SyncSlave {
    socket: UdpSocket,
}

impl SyncSlave {
    /// 待ち受けソケットを開く
    ///
    /// マルチキャストグループを指定した場合は `0.0.0.0:port` にバインドして参加します。
    pub fn bind(listen_addr: IpAddr, port: u16, multicast: Option<Ipv4Addr>) -> Result<Self, NetworkError> {
        let addr = match multicast {
            Some(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
            None => SocketAddr::new(listen_addr, port),
        };

        let socket = UdpSocket::bind(addr).map_err(|source| NetworkError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        if let Some(group) = multicast {
            socket
                .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
                .map_err(|source| NetworkError::Bind {
                    addr: group.to_string(),
                    source,
                })?;
            info!("マルチキャストグループに参加しました: {}", group);
        }
        socket.set_read_timeout(Some(RECEIVE_TIMEOUT))?;

        info!("同期メッセージを待ち受けます: {}", socket.local_addr()?);
        Ok(Self { socket })
    }

    /// バインドしたアドレス
    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        Ok(self.socket.local_addr()?)
    }

    /// 1データグラムを受信
    ///
    /// タイムアウトや不正なデータグラムは `None` になります。
    pub fn receive(&self) -> Result<Option<SyncMessage>, NetworkError> {
        let mut buf = [0u8; 64];
        match self.socket.recv_from(&mut buf) {
            Ok((len, from)) => match SyncMessage::decode(&buf[..len]) {
                Ok(message) => Ok(Some(message)),
                Err(e) => {
                    warn!("{} からの同期メッセージを無視します: {}", from, e);
                    Ok(None)
                },
            },
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// 同期メッセージを反映
    ///
    /// インデックスが変わった場合は画像を切り替えてから、受信した平行移動とズームを
    /// そのまま設定します。画像を切り替えた場合は `true` を返します。
    pub fn apply(&self, message: &SyncMessage, ctx: &ViewContext, navigator: &Navigator) -> Result<bool, NetworkError> {
        let len = navigator.playlist().len();
        if message.index < 0 || message.index as usize >= len {
            return Err(NetworkError::Desynchronized {
                index: message.index,
                len,
            });
        }

        let index = message.index as usize;
        let current = ctx.lock().index;
        // デコードは状態ロックの外で行う
        let switch = if index != current {
            Some(navigator.fetch_index(index))
        } else {
            None
        };

        let mut state = ctx.lock();
        let switched = switch.is_some();
        if let Some(image) = switch {
            debug!("同期により画像を切り替えます: {} -> {}", current, index);
            state.set_image(image, index);
        }
        state.dx = message.dx as f64;
        state.dy = message.dy as f64;
        state.z = message.z as f64;
        Ok(switched)
    }

    /// 終了まで受信を続ける
    pub fn run(&self, ctx: &ViewContext, navigator: &Navigator) -> Result<(), NetworkError> {
        while ctx.is_running() {
            if let Some(message) = self.receive()? {
                self.apply(&message, ctx, navigator)?;
            }
        }
        debug!("同期スレーブを終了しました");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ImageCache;
    use crate::network::SyncMaster;
    use crate::network::SlaveDescriptor;
    use crate::playlist::Playlist;
    use crate::test_support::CountingDecoder;
    use crate::view::{ViewState, Viewport, DEFAULT_ZOOM_RANGE};
    use pano_view_rs_common::SYNC_MAGIC;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn viewer(entries: usize) -> (Arc<ViewContext>, Navigator) {
        let ctx = Arc::new(ViewContext::new(ViewState::new(Viewport::new(20, 10), DEFAULT_ZOOM_RANGE, false)));
        let cache = Arc::new(ImageCache::new(5, Arc::new(CountingDecoder::new(40, 20))).unwrap());
        let playlist = Playlist::new((0..entries).map(|i| PathBuf::from(format!("{}.ppm", i))).collect());
        let navigator = Navigator::new(ctx.clone(), cache, Arc::new(playlist), None);
        navigator.show_index(0);
        (ctx, navigator)
    }

    fn loopback_slave() -> (SyncSlave, SlaveDescriptor) {
        let slave = SyncSlave::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, None).unwrap();
        let port = slave.local_addr().unwrap().port();
        (slave, SlaveDescriptor::parse(&format!("127.0.0.1:{}", port), false).unwrap())
    }

    fn receive_one(slave: &SyncSlave) -> SyncMessage {
        for _ in 0..20 {
            if let Some(message) = slave.receive().unwrap() {
                return message;
            }
        }
        panic!("同期メッセージを受信できませんでした");
    }

    #[test]
    fn test_master_to_slave_replicates_view() {
        let (master_ctx, _master_nav) = viewer(5);
        let (slave_ctx, slave_nav) = viewer(5);
        let (slave, descriptor) = loopback_slave();
        let mut master = SyncMaster::new(vec![descriptor], &master_ctx).unwrap();

        {
            let mut state = master_ctx.lock();
            state.index = 3;
            state.dx = 10.5;
            state.dy = -2.0;
            state.z = 0.75;
        }
        assert!(master.poll(&master_ctx).unwrap());

        let message = receive_one(&slave);
        let switched = slave.apply(&message, &slave_ctx, &slave_nav).unwrap();

        assert!(switched);
        let state = slave_ctx.lock();
        assert_eq!(state.index, 3);
        assert_eq!(state.dx, 10.5);
        assert_eq!(state.dy, -2.0);
        assert_eq!(state.z, 0.75);
        assert_eq!(state.image().map(|i| i.path().to_path_buf()), Some(PathBuf::from("3.ppm")));
    }

    #[test]
    fn test_same_index_does_not_switch() {
        let (ctx, navigator) = viewer(2);
        let (slave, _) = loopback_slave();
        let before = ctx.lock().image().cloned();

        let switched = slave.apply(&SyncMessage::new(0, 1.0, 2.0, 0.5), &ctx, &navigator).unwrap();

        assert!(!switched);
        let state = ctx.lock();
        assert_eq!((state.dx, state.dy, state.z), (1.0, 2.0, 0.5));
        assert!(Arc::ptr_eq(state.image().unwrap(), before.as_ref().unwrap()));
    }

    #[test]
    fn test_out_of_range_index_is_fatal() {
        let (ctx, navigator) = viewer(3);
        let (slave, _) = loopback_slave();

        for index in [3, 100, -1] {
            let result = slave.apply(&SyncMessage::new(index, 0.0, 0.0, 1.0), &ctx, &navigator);
            assert!(matches!(result, Err(NetworkError::Desynchronized { len: 3, .. })));
        }
        assert_eq!(ctx.lock().index, 0);
    }

    #[test]
    fn test_bad_magic_is_ignored() {
        let (slave, descriptor) = loopback_slave();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        let target = format!("127.0.0.1:{}", descriptor.port);

        let mut bytes = SyncMessage::new(1, 0.0, 0.0, 1.0).encode();
        bytes[0..4].copy_from_slice(&(SYNC_MAGIC + 1).to_ne_bytes());
        sender.send_to(&bytes, &target).unwrap();
        sender.send_to(&bytes[..10], &target).unwrap();
        sender.send_to(&SyncMessage::new(2, 0.0, 0.0, 1.0).encode(), &target).unwrap();

        assert_eq!(receive_one(&slave).index, 2);
    }

    #[test]
    fn test_run_stops_on_desynchronization() {
        let (ctx, navigator) = viewer(2);
        let (slave, descriptor) = loopback_slave();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender
            .send_to(&SyncMessage::new(7, 0.0, 0.0, 1.0).encode(), ("127.0.0.1", descriptor.port))
            .unwrap();

        let result = slave.run(&ctx, &navigator);

        assert!(matches!(result, Err(NetworkError::Desynchronized { index: 7, len: 2 })));
    }
}
