//! Scripted emulator peer speaking both room channels

use crate::TestConfig;
use anyhow::{bail, Context, Result};
use bytes::{BufMut, BytesMut};
use netplay_protocol::control::{
    CUSTOM_RECEIVE_START, CUSTOM_SEND_START, DISCONNECT_NOTICE, GET_REGISTRATION, RECEIVE_SAVE,
    RECEIVE_SAVE_WITH_SIZE, RECEIVE_SETTINGS, REGISTER_PLAYER, SEND_SAVE, SEND_SETTINGS,
};
use netplay_protocol::{
    ClientPacket, Cp0Info, InputRequest, KeyInfo, PluginKind, ServerInput, CP0_DIGEST_LEN,
    REGISTRATION_TABLE_LEN,
};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

pub struct TestPeer {
    pub slot: u8,
    pub nonce: u32,
    tcp: TcpStream,
    udp: UdpSocket,
    room: SocketAddr,
    config: TestConfig,
}

impl TestPeer {
    /// Open a control connection and a UDP socket to the room on `port`
    pub async fn connect(port: u16, slot: u8, nonce: u32) -> Result<Self> {
        let room = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let tcp = TcpStream::connect(room)
            .await
            .with_context(|| format!("Failed to connect to {room}"))?;
        let udp = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .context("Failed to bind peer UDP socket")?;
        Ok(Self {
            slot,
            nonce,
            tcp,
            udp,
            room,
            config: TestConfig::default(),
        })
    }

    pub fn with_config(mut self, config: TestConfig) -> Self {
        self.config = config;
        self
    }

    pub fn udp_addr(&self) -> Result<SocketAddr> {
        Ok(self.udp.local_addr()?)
    }

    async fn read_exact(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        timeout(self.config.reply_timeout, self.tcp.read_exact(&mut buf))
            .await
            .context("Timed out waiting for control reply")??;
        Ok(buf)
    }

    /// Register this peer's slot. Returns (accepted, buffer target).
    pub async fn register(&mut self, plugin: PluginKind, raw: bool) -> Result<(bool, u8)> {
        let mut msg = BytesMut::new();
        msg.put_u8(REGISTER_PLAYER);
        msg.put_u8(self.slot);
        msg.put_u8(plugin.0);
        msg.put_u8(u8::from(raw));
        msg.put_u32(self.nonce);
        self.tcp.write_all(&msg).await?;

        let reply = self.read_exact(2).await?;
        Ok((reply[0] == 1, reply[1]))
    }

    pub async fn request_registration_table(&mut self) -> Result<Vec<u8>> {
        self.tcp.write_all(&[GET_REGISTRATION]).await?;
        self.read_registration_table().await
    }

    /// Read the reply to an earlier table request
    pub async fn read_registration_table(&mut self) -> Result<Vec<u8>> {
        self.read_exact(REGISTRATION_TABLE_LEN).await
    }

    /// Ask for the table and report whether any reply arrives within `wait`
    pub async fn registration_table_pending(&mut self, wait: Duration) -> Result<bool> {
        self.tcp.write_all(&[GET_REGISTRATION]).await?;
        let mut byte = [0u8; 1];
        match timeout(wait, self.tcp.peek(&mut byte)).await {
            Err(_) => Ok(true),
            Ok(Ok(0)) => bail!("room closed the control connection"),
            Ok(Ok(_)) => Ok(false),
            Ok(Err(e)) => Err(e.into()),
        }
    }

    pub async fn send_save(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let mut msg = BytesMut::new();
        msg.put_u8(SEND_SAVE);
        msg.put_slice(name.as_bytes());
        msg.put_u8(0);
        msg.put_u32(u32::try_from(data.len())?);
        msg.put_slice(data);
        self.tcp.write_all(&msg).await?;
        Ok(())
    }

    /// Fetch a save file with the sized request; the reply carries its length
    pub async fn request_save(&mut self, name: &str) -> Result<Vec<u8>> {
        let mut msg = BytesMut::new();
        msg.put_u8(RECEIVE_SAVE_WITH_SIZE);
        msg.put_slice(name.as_bytes());
        msg.put_u8(0);
        self.tcp.write_all(&msg).await?;

        let size = self.read_exact(4).await?;
        let size = u32::from_be_bytes([size[0], size[1], size[2], size[3]]) as usize;
        self.read_exact(size).await
    }

    /// Fetch a save file with the unsized request, whose length the caller
    /// already knows
    pub async fn request_save_unsized(&mut self, name: &str, len: usize) -> Result<Vec<u8>> {
        let mut msg = BytesMut::new();
        msg.put_u8(RECEIVE_SAVE);
        msg.put_slice(name.as_bytes());
        msg.put_u8(0);
        self.tcp.write_all(&msg).await?;
        self.read_exact(len).await
    }

    pub async fn send_settings(&mut self, settings: &[u8]) -> Result<()> {
        let mut msg = BytesMut::with_capacity(settings.len() + 1);
        msg.put_u8(SEND_SETTINGS);
        msg.put_slice(settings);
        self.tcp.write_all(&msg).await?;
        Ok(())
    }

    pub async fn request_settings(&mut self, len: usize) -> Result<Vec<u8>> {
        self.tcp.write_all(&[RECEIVE_SETTINGS]).await?;
        self.read_exact(len).await
    }

    pub async fn send_custom(&mut self, key: u8, data: &[u8]) -> Result<()> {
        let mut msg = BytesMut::new();
        msg.put_u8(CUSTOM_SEND_START + key);
        msg.put_u32(u32::try_from(data.len())?);
        msg.put_slice(data);
        self.tcp.write_all(&msg).await?;
        Ok(())
    }

    pub async fn request_custom(&mut self, key: u8, len: usize) -> Result<Vec<u8>> {
        self.tcp.write_all(&[CUSTOM_RECEIVE_START + key]).await?;
        self.read_exact(len).await
    }

    pub async fn disconnect(&mut self) -> Result<()> {
        let mut msg = BytesMut::new();
        msg.put_u8(DISCONNECT_NOTICE);
        msg.put_u32(self.nonce);
        self.tcp.write_all(&msg).await?;
        Ok(())
    }

    /// True once the room has closed this peer's control connection
    pub async fn control_closed(&mut self) -> Result<bool> {
        let mut byte = [0u8; 1];
        match timeout(self.config.close_timeout, self.tcp.read(&mut byte)).await {
            Ok(Ok(0)) | Ok(Err(_)) => Ok(true),
            Ok(Ok(_)) | Err(_) => Ok(false),
        }
    }

    async fn send_packet(&self, packet: ClientPacket) -> Result<()> {
        let mut buf = BytesMut::new();
        packet.encode(&mut buf);
        self.udp.send_to(&buf, self.room).await?;
        Ok(())
    }

    pub async fn send_key_info(&self, frame: u32, input: u32, plugin: u8) -> Result<()> {
        self.send_packet(ClientPacket::KeyInfo(KeyInfo {
            slot: self.slot,
            frame,
            input,
            plugin,
        }))
        .await
    }

    pub async fn send_input_request(
        &self,
        target: u8,
        frame: u32,
        spectator: bool,
        buffer_health: u8,
    ) -> Result<()> {
        self.send_packet(ClientPacket::InputRequest(InputRequest {
            slot: target,
            nonce: self.nonce,
            frame,
            spectator,
            buffer_health,
        }))
        .await
    }

    /// Request `target`'s inputs from `frame` and wait for the reply
    pub async fn request_input(
        &self,
        target: u8,
        frame: u32,
        buffer_health: u8,
    ) -> Result<ServerInput> {
        self.send_input_request(target, frame, false, buffer_health).await?;
        self.recv_input().await
    }

    /// Next input datagram from the room, requested or gratuitous
    pub async fn recv_input(&self) -> Result<ServerInput> {
        let mut buf = vec![0u8; 1500];
        let (len, _) = timeout(self.config.reply_timeout, self.udp.recv_from(&mut buf))
            .await
            .context("Timed out waiting for input datagram")??;
        Ok(ServerInput::decode(&buf[..len])?)
    }

    /// Report a CP0 digest made of `fill` repeated
    pub async fn send_cp0(&self, vi_count: u32, fill: u8) -> Result<()> {
        self.send_packet(ClientPacket::Cp0Info(Cp0Info {
            vi_count,
            digest: vec![fill; CP0_DIGEST_LEN].into(),
        }))
        .await
    }
}
