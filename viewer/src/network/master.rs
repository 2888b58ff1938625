//! 同期マスター
//!
//! 表示状態が変わるたびに同期メッセージを全スレーブへ送信します。
//! ソケットは最初の送信時にスレーブごとに1つ開き、以後は使い回します。

use crate::network::{NetworkError, SlaveDescriptor, MAX_SLAVES};
use crate::view::ViewContext;
use log::{debug, info, warn};
use pano_view_rs_common::SyncMessage;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::thread;
use std::time::Duration;

/// 変化がないときの確認間隔
pub const CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// 同期マスター
pub struct SyncMaster {
    slaves: Vec<SlaveDescriptor>,
    sockets: Vec<UdpSocket>,
    last_sent: SyncMessage,
}

impl SyncMaster {
    /// 新しいマスターを作成
    ///
    /// 現在の状態を送信済みとみなすので、最初の送信は状態が変わったときです。
    pub fn new(slaves: Vec<SlaveDescriptor>, ctx: &ViewContext) -> Result<Self, NetworkError> {
        if slaves.len() > MAX_SLAVES {
            return Err(NetworkError::TooManySlaves(slaves.len()));
        }

        Ok(Self {
            slaves,
            sockets: Vec::new(),
            last_sent: Self::current_message(ctx),
        })
    }

    /// 現在の表示状態から同期メッセージを作る
    pub fn current_message(ctx: &ViewContext) -> SyncMessage {
        let state = ctx.lock();
        SyncMessage::new(state.index as i32, state.dx as f32, state.dy as f32, state.z as f32)
    }

    /// 送信先
    pub fn slaves(&self) -> &[SlaveDescriptor] {
        &self.slaves
    }

    /// 状態が変わっていれば送信する
    ///
    /// 送信した場合は `true` を返します。
    pub fn poll(&mut self, ctx: &ViewContext) -> Result<bool, NetworkError> {
        let message = Self::current_message(ctx);
        if message == self.last_sent {
            return Ok(false);
        }
        self.send(&message)?;
        self.last_sent = message;
        Ok(true)
    }

    /// 送信用ソケットを開く
    fn open_sockets(&mut self) -> Result<(), NetworkError> {
        if !self.sockets.is_empty() {
            return Ok(());
        }

        for slave in &self.slaves {
            let addr = resolve(slave)?;
            let local = "0.0.0.0:0";
            let socket = UdpSocket::bind(local).map_err(|source| NetworkError::Bind {
                addr: local.to_string(),
                source,
            })?;
            if slave.broadcast {
                socket.set_broadcast(true)?;
            }
            socket.connect(addr).map_err(|source| NetworkError::Connect {
                addr: slave.address(),
                source,
            })?;
            info!("スレーブに接続しました: {}", slave);
            self.sockets.push(socket);
        }
        Ok(())
    }

    /// 全スレーブに送信
    ///
    /// 個々の送信失敗は警告にとどめます。
    pub fn send(&mut self, message: &SyncMessage) -> Result<(), NetworkError> {
        self.open_sockets()?;

        let bytes = message.encode();
        for (socket, slave) in self.sockets.iter().zip(&self.slaves) {
            if let Err(e) = socket.send(&bytes) {
                warn!("{} への送信に失敗しました: {}", slave, e);
            }
        }
        debug!(
            "同期メッセージを送信しました: index={} dx={} dy={} z={}",
            message.index, message.dx, message.dy, message.z
        );
        Ok(())
    }

    /// 終了まで送信を続ける
    pub fn run(&mut self, ctx: &ViewContext) -> Result<(), NetworkError> {
        if self.slaves.is_empty() {
            debug!("スレーブがないため送信しません");
            return Ok(());
        }

        info!("同期マスターを開始します（スレーブ数: {}）", self.slaves.len());
        while ctx.is_running() {
            if !self.poll(ctx)? {
                thread::sleep(CHECK_INTERVAL);
            }
        }
        Ok(())
    }
}

fn resolve(slave: &SlaveDescriptor) -> Result<SocketAddr, NetworkError> {
    let connect_error = |source| NetworkError::Connect {
        addr: slave.address(),
        source,
    };
    (slave.host.as_str(), slave.port)
        .to_socket_addrs()
        .map_err(connect_error)?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| {
            connect_error(std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                "IPv4アドレスが見つかりません",
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::{ViewState, Viewport, DEFAULT_ZOOM_RANGE};
    use std::time::Duration;

    fn context() -> ViewContext {
        ViewContext::new(ViewState::new(Viewport::new(10, 10), DEFAULT_ZOOM_RANGE, false))
    }

    fn receiver() -> (UdpSocket, SlaveDescriptor) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let port = socket.local_addr().unwrap().port();
        (socket, SlaveDescriptor::parse(&format!("127.0.0.1:{}", port), false).unwrap())
    }

    #[test]
    fn test_sends_only_on_change() {
        let ctx = context();
        let (socket, slave) = receiver();
        let mut master = SyncMaster::new(vec![slave], &ctx).unwrap();

        assert!(!master.poll(&ctx).unwrap());

        {
            let mut state = ctx.lock();
            state.dx = 10.5;
            state.index = 3;
        }
        assert!(master.poll(&ctx).unwrap());
        assert!(!master.poll(&ctx).unwrap());

        let mut buf = [0u8; 64];
        let n = socket.recv(&mut buf).unwrap();
        let message = SyncMessage::decode(&buf[..n]).unwrap();
        assert_eq!(message.index, 3);
        assert_eq!(message.dx, 10.5);
    }

    #[test]
    fn test_sends_to_every_slave() {
        let ctx = context();
        let receivers: Vec<_> = (0..3).map(|_| receiver()).collect();
        let slaves = receivers.iter().map(|(_, slave)| slave.clone()).collect();
        let mut master = SyncMaster::new(slaves, &ctx).unwrap();

        master.send(&SyncMessage::new(1, 2.0, 3.0, 0.5)).unwrap();

        for (socket, _) in &receivers {
            let mut buf = [0u8; 64];
            let n = socket.recv(&mut buf).unwrap();
            assert_eq!(SyncMessage::decode(&buf[..n]).unwrap(), SyncMessage::new(1, 2.0, 3.0, 0.5));
        }
    }

    #[test]
    fn test_too_many_slaves() {
        let ctx = context();
        let slaves = (0..=MAX_SLAVES)
            .map(|i| SlaveDescriptor::parse(&format!("127.0.0.1:{}", 5000 + i), false).unwrap())
            .collect();

        assert!(matches!(SyncMaster::new(slaves, &ctx), Err(NetworkError::TooManySlaves(31))));
    }
}
