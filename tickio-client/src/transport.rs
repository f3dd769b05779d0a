//! 传输层
//!
//! 协议层只依赖 [`Transport`] 与 [`TransportListener`] 两个接口；
//! 默认实现 [`WsTransport`] 基于 tokio-tungstenite。

use crate::config::{SocketConfig, TlsConfig};
use crate::error::TransportError;
use crate::lock;
use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use native_tls::{Certificate, Identity, TlsConnector};
use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector};
use tracing::{debug, info, warn};

/// 传输层回调，在 I/O 任务上执行
pub trait TransportListener: Send + Sync {
    fn on_open(&self);
    fn on_message(&self, raw: &str);
    fn on_close(&self);
    fn on_error(&self, error: TransportError);
}

/// 原始帧传输
pub trait Transport: Send + Sync {
    /// 建立连接，成功后通过 `listener` 推送帧
    fn connect(
        &self,
        listener: Arc<dyn TransportListener>,
    ) -> BoxFuture<'_, Result<(), TransportError>>;

    /// 发送一帧文本，未连接时返回 `NotConnected`
    fn send(&self, frame: String) -> Result<(), TransportError>;

    fn close(&self);

    fn is_connected(&self) -> bool;
}

struct ActiveConnection {
    generation: u64,
    outbound: mpsc::UnboundedSender<Message>,
    reader: Option<AbortHandle>,
}

impl ActiveConnection {
    /// 发送 Close 帧并停掉读任务，不回调 listener
    fn shutdown(self) {
        let _ = self.outbound.send(Message::Close(None));
        if let Some(reader) = self.reader {
            reader.abort();
        }
    }
}

/// WebSocket 传输
pub struct WsTransport {
    url: String,
    headers: Vec<(String, String)>,
    tls: TlsConfig,
    active: Arc<Mutex<Option<ActiveConnection>>>,
    generation: AtomicU64,
}

impl WsTransport {
    pub fn new(config: &SocketConfig) -> Self {
        Self {
            url: config.url.clone(),
            headers: config.headers.clone(),
            tls: config.tls.clone(),
            active: Arc::new(Mutex::new(None)),
            generation: AtomicU64::new(0),
        }
    }

    fn build_request(
        &self,
    ) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;

        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::InvalidRequest(format!("{}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
            request.headers_mut().insert(name, value);
        }
        Ok(request)
    }

    async fn open(&self, listener: Arc<dyn TransportListener>) -> Result<(), TransportError> {
        let request = self.build_request()?;
        let connector = build_tls_connector(&self.tls)?.map(Connector::NativeTls);

        info!("[WsTransport] Connecting to {}", self.url);
        let (stream, _) = connect_async_tls_with_config(request, None, false, connector)
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        let (mut sink, mut source) = stream.split();
        let (outbound, mut rx) = mpsc::unbounded_channel::<Message>();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let previous = lock(&self.active).replace(ActiveConnection {
            generation,
            outbound,
            reader: None,
        });
        if let Some(previous) = previous {
            debug!("[WsTransport] Replacing generation {}", previous.generation);
            previous.shutdown();
        }
        info!("[WsTransport] Connected (generation {})", generation);
        listener.on_open();

        // 写任务：串行化所有发送，Close 帧之后退出
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    debug!("[WsTransport] Write failed: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // 读任务：把文本帧交给 listener
        let active = self.active.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => listener.on_message(text.as_str()),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("[WsTransport] Read failed: {}", e);
                        listener.on_error(TransportError::Io(e.to_string()));
                        break;
                    }
                }
            }

            // 旧连接的读任务既不能清掉新连接，也不能替它报告关闭
            let current = {
                let mut active = lock(&active);
                let current = active.as_ref().map(|c| c.generation) == Some(generation);
                if current {
                    *active = None;
                }
                current
            };
            if current {
                info!("[WsTransport] Connection closed (generation {})", generation);
                listener.on_close();
            } else {
                debug!("[WsTransport] Stale reader finished (generation {})", generation);
            }
        });

        if let Some(connection) = lock(&self.active).as_mut() {
            if connection.generation == generation {
                connection.reader = Some(reader.abort_handle());
            }
        }
        Ok(())
    }
}

impl Transport for WsTransport {
    fn connect(
        &self,
        listener: Arc<dyn TransportListener>,
    ) -> BoxFuture<'_, Result<(), TransportError>> {
        self.open(listener).boxed()
    }

    fn send(&self, frame: String) -> Result<(), TransportError> {
        let active = lock(&self.active);
        let connection = active.as_ref().ok_or(TransportError::NotConnected)?;
        connection
            .outbound
            .send(Message::text(frame))
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    /// 主动关闭不会回调 `on_close`，由调用方自己标记关闭
    fn close(&self) {
        let connection = lock(&self.active).take();
        if let Some(connection) = connection {
            debug!("[WsTransport] Closing generation {}", connection.generation);
            connection.shutdown();
        }
    }

    fn is_connected(&self) -> bool {
        lock(&self.active).is_some()
    }
}

/// 构建 TLS 连接器（支持 mTLS）
pub(crate) fn build_tls_connector(tls: &TlsConfig) -> Result<Option<TlsConnector>, TransportError> {
    if tls.is_empty() {
        return Ok(None);
    }

    let mut builder = TlsConnector::builder();

    // 加载 CA 证书
    if let Some(ca_path) = &tls.ca_cert_path {
        info!("Loading CA certificate from {:?}", ca_path);
        let ca_pem = fs::read(ca_path)
            .map_err(|e| TransportError::Tls(format!("Failed to read CA cert: {}", e)))?;
        let ca_cert = Certificate::from_pem(&ca_pem)
            .map_err(|e| TransportError::Tls(format!("Failed to parse CA cert: {}", e)))?;
        builder.add_root_certificate(ca_cert);
    }

    // 加载客户端证书（mTLS）
    if let Some(cert_path) = &tls.client_cert_path {
        info!("Loading client certificate from {:?}", cert_path);
        let cert_data = fs::read(cert_path)
            .map_err(|e| TransportError::Tls(format!("Failed to read client cert: {}", e)))?;

        let is_p12 = cert_path
            .extension()
            .map(|ext| ext == "p12" || ext == "pfx")
            .unwrap_or(false);

        let identity = if is_p12 {
            let password = tls.client_p12_password.as_deref().unwrap_or("");
            Identity::from_pkcs12(&cert_data, password)
                .map_err(|e| TransportError::Tls(format!("Failed to parse PKCS#12: {}", e)))?
        } else {
            let key_path = tls.client_key_path.as_ref().ok_or_else(|| {
                TransportError::Tls("Client key path required for PEM format".into())
            })?;
            let key_pem = fs::read(key_path)
                .map_err(|e| TransportError::Tls(format!("Failed to read client key: {}", e)))?;
            Identity::from_pkcs8(&cert_data, &key_pem).map_err(|e| {
                TransportError::Tls(format!("Failed to create identity from PEM: {}", e))
            })?
        };
        builder.identity(identity);
    }

    // 开发模式：跳过证书验证
    if tls.danger_accept_invalid_certs {
        warn!("TLS certificate verification disabled - FOR DEVELOPMENT ONLY");
        builder.danger_accept_invalid_certs(true);
    }

    builder
        .build()
        .map(Some)
        .map_err(|e| TransportError::Tls(format!("Failed to build TLS connector: {}", e)))
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;

    /// 内存传输：记录发送的帧，测试可手动推送入站帧
    #[derive(Default)]
    pub(crate) struct MockTransport {
        connected: AtomicBool,
        fail_connect: AtomicBool,
        connect_calls: AtomicUsize,
        close_calls: AtomicUsize,
        connect_delay: Mutex<Duration>,
        sent: Mutex<Vec<String>>,
        listener: Mutex<Option<Arc<dyn TransportListener>>>,
    }

    impl MockTransport {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub(crate) fn sent(&self) -> Vec<String> {
            lock(&self.sent).clone()
        }

        pub(crate) fn close_calls(&self) -> usize {
            self.close_calls.load(Ordering::SeqCst)
        }

        pub(crate) fn connect_calls(&self) -> usize {
            self.connect_calls.load(Ordering::SeqCst)
        }

        pub(crate) fn set_fail_connect(&self, fail: bool) {
            self.fail_connect.store(fail, Ordering::SeqCst);
        }

        /// 握手耗时，期间连接尚未建立
        pub(crate) fn set_connect_delay(&self, delay: Duration) {
            *lock(&self.connect_delay) = delay;
        }

        /// 直接改变连接状态，不触发回调
        pub(crate) fn set_connected(&self, connected: bool) {
            self.connected.store(connected, Ordering::SeqCst);
        }

        /// 模拟服务器推送一帧
        pub(crate) fn deliver(&self, raw: &str) {
            let listener = lock(&self.listener).clone();
            if let Some(listener) = listener {
                listener.on_message(raw);
            }
        }

        /// 模拟对端断开
        pub(crate) fn drop_connection(&self) {
            self.connected.store(false, Ordering::SeqCst);
            let listener = lock(&self.listener).clone();
            if let Some(listener) = listener {
                listener.on_close();
            }
        }
    }

    impl Transport for MockTransport {
        fn connect(
            &self,
            listener: Arc<dyn TransportListener>,
        ) -> BoxFuture<'_, Result<(), TransportError>> {
            async move {
                self.connect_calls.fetch_add(1, Ordering::SeqCst);
                let delay = *lock(&self.connect_delay);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if self.fail_connect.load(Ordering::SeqCst) {
                    return Err(TransportError::ConnectFailed("mock refused".into()));
                }
                *lock(&self.listener) = Some(listener.clone());
                self.connected.store(true, Ordering::SeqCst);
                listener.on_open();
                Ok(())
            }
            .boxed()
        }

        fn send(&self, frame: String) -> Result<(), TransportError> {
            if !self.connected.load(Ordering::SeqCst) {
                return Err(TransportError::NotConnected);
            }
            lock(&self.sent).push(frame);
            Ok(())
        }

        fn close(&self) {
            self.close_calls.fetch_add(1, Ordering::SeqCst);
            self.connected.store(false, Ordering::SeqCst);
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }
}
