//! tickio FFI - C ABI 导出层
//!
//! 为游戏引擎等原生宿主提供 tickio-client 的 C 接口。
//!
//! 约定：
//! - 网络 I/O 在库内部的后台线程上进行
//! - 所有回调只在宿主调用 `tickio_tick` 时、在调用线程上触发
//! - 返回的字符串由 `tickio_free_string` 释放

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::ffi::{c_char, c_void, CStr, CString};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tickio_client::{
    Handler, SocketClient, SocketConfig, SocketError, SocketIoEvent, TickReport, TlsConfig,
};
use tracing::{error, warn};

// ==================== 错误码 ====================

/// FFI 错误码
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickioError {
    Success = 0,
    NullPointer = 1,
    InvalidUtf8 = 2,
    InvalidJson = 3,
    InvalidConfig = 4,
    NotConnected = 5,
    EmitFailed = 6,
    RuntimeError = 7,
    UnknownToken = 8,
    Unknown = 99,
}

impl From<SocketError> for TickioError {
    fn from(err: SocketError) -> Self {
        match err {
            SocketError::InvalidUrl(_) | SocketError::InvalidConfig(_) => Self::InvalidConfig,
            SocketError::NotConnected => Self::NotConnected,
            SocketError::EmitFailed(_) | SocketError::Transport(_) => Self::EmitFailed,
            SocketError::SerializationError(_) | SocketError::Decode(_) => Self::InvalidJson,
            SocketError::IoError(_) => Self::RuntimeError,
            _ => Self::Unknown,
        }
    }
}

// ==================== 回调 ====================

/// 事件回调：`data_json` 无数据时为 null，仅在回调期间有效
pub type TickioEventCallback =
    extern "C" fn(event: *const c_char, data_json: *const c_char, user_data: *mut c_void);

/// Ack 回调：`data_json` 是回执的完整参数数组，仅在回调期间有效
pub type TickioAckCallback = extern "C" fn(data_json: *const c_char, user_data: *mut c_void);

struct UserData(*mut c_void);

impl UserData {
    fn get(&self) -> *mut c_void {
        self.0
    }
}

// 回调只在 tick 线程上使用，由宿主保证 user_data 的有效性
unsafe impl Send for UserData {}
unsafe impl Sync for UserData {}

/// 一次 tick 的统计
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickioTickReport {
    pub events: u32,
    pub acks_resolved: u32,
    pub acks_expired: u32,
    pub handler_failures: u32,
}

impl From<TickReport> for TickioTickReport {
    fn from(report: TickReport) -> Self {
        let clamp = |n: usize| u32::try_from(n).unwrap_or(u32::MAX);
        Self {
            events: clamp(report.events),
            acks_resolved: clamp(report.acks_resolved),
            acks_expired: clamp(report.acks_expired),
            handler_failures: clamp(report.handler_failures),
        }
    }
}

// ==================== 句柄 ====================

/// 不透明句柄
pub struct TickioHandle {
    client: SocketClient,
    /// token → (事件名, 回调)，用于 `tickio_off`
    subscriptions: Mutex<HashMap<u64, (String, Handler)>>,
    next_token: AtomicU64,
}

/// `tickio_create` 的可选配置（JSON），时间单位毫秒
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FfiOptions {
    auto_connect: Option<bool>,
    reconnect_delay_ms: Option<u64>,
    ack_expiration_ms: Option<u64>,
    ping_interval_ms: Option<u64>,
    ping_timeout_ms: Option<u64>,
    headers: BTreeMap<String, String>,
    tls: Option<FfiTlsOptions>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FfiTlsOptions {
    ca_cert_path: Option<PathBuf>,
    client_cert_path: Option<PathBuf>,
    client_key_path: Option<PathBuf>,
    client_p12_password: Option<String>,
    danger_accept_invalid_certs: bool,
}

impl FfiOptions {
    fn into_config(self, url: &str) -> SocketConfig {
        let mut config = SocketConfig::with_url(url);
        if let Some(auto_connect) = self.auto_connect {
            config.auto_connect = auto_connect;
        }
        if let Some(ms) = self.reconnect_delay_ms {
            config.reconnect_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = self.ack_expiration_ms {
            config.ack_expiration = Duration::from_millis(ms);
        }
        if let Some(ms) = self.ping_interval_ms {
            config.ping_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.ping_timeout_ms {
            config.ping_timeout = Duration::from_millis(ms);
        }
        config.headers = self.headers.into_iter().collect();
        if let Some(tls) = self.tls {
            config.tls = TlsConfig {
                ca_cert_path: tls.ca_cert_path,
                client_cert_path: tls.client_cert_path,
                client_key_path: tls.client_key_path,
                client_p12_password: tls.client_p12_password,
                danger_accept_invalid_certs: tls.danger_accept_invalid_certs,
            };
        }
        config
    }
}

// ==================== 创建/销毁 ====================

/// 创建客户端
///
/// # Safety
/// - `url` 必须是有效的 UTF-8 C 字符串（如 "ws://127.0.0.1:4567/socket.io/?EIO=3&transport=websocket"）
/// - `options_json` 可为 null 使用默认配置
/// - 返回的句柄需要通过 `tickio_destroy` 释放
#[no_mangle]
pub unsafe extern "C" fn tickio_create(
    url: *const c_char,
    options_json: *const c_char,
    out_handle: *mut *mut TickioHandle,
) -> TickioError {
    if url.is_null() || out_handle.is_null() {
        return TickioError::NullPointer;
    }

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let url = to_str(url)?;
        let options = if options_json.is_null() {
            FfiOptions::default()
        } else {
            serde_json::from_str::<FfiOptions>(to_str(options_json)?).map_err(|e| {
                warn!("[tickio-ffi] Invalid options: {}", e);
                TickioError::InvalidJson
            })?
        };

        let client = SocketClient::new(options.into_config(url)).map_err(|e| {
            warn!("[tickio-ffi] Create failed: {}", e);
            TickioError::from(e)
        })?;

        Ok(TickioHandle {
            client,
            subscriptions: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        })
    }));

    match result {
        Ok(Ok(handle)) => {
            *out_handle = Box::into_raw(Box::new(handle));
            TickioError::Success
        }
        Ok(Err(e)) => e,
        Err(_) => TickioError::Unknown,
    }
}

/// 销毁客户端（会先断开连接）
///
/// # Safety
/// - `handle` 必须是 `tickio_create` 返回的有效句柄
/// - 调用后句柄不再有效
#[no_mangle]
pub unsafe extern "C" fn tickio_destroy(handle: *mut TickioHandle) {
    if handle.is_null() {
        return;
    }
    let handle = Box::from_raw(handle);
    if panic::catch_unwind(AssertUnwindSafe(move || drop(handle))).is_err() {
        error!("[tickio-ffi] Panic while destroying handle");
    }
}

// ==================== 连接管理 ====================

/// 请求连接；结果通过 `open` / `connect` / `error` 事件在 tick 中报告
///
/// # Safety
/// - `handle` 必须是有效句柄
#[no_mangle]
pub unsafe extern "C" fn tickio_connect(handle: *mut TickioHandle) -> TickioError {
    if handle.is_null() {
        return TickioError::NullPointer;
    }
    let handle = &*handle;
    guard(|| {
        handle.client.connect();
        Ok(())
    })
}

/// 断开连接，可重复调用
///
/// # Safety
/// - `handle` 必须是有效句柄
#[no_mangle]
pub unsafe extern "C" fn tickio_close(handle: *mut TickioHandle) -> TickioError {
    if handle.is_null() {
        return TickioError::NullPointer;
    }
    let handle = &*handle;
    guard(|| {
        handle.client.close();
        Ok(())
    })
}

/// 传输层是否已连接
///
/// # Safety
/// - `handle` 必须是有效句柄
#[no_mangle]
pub unsafe extern "C" fn tickio_is_connected(handle: *const TickioHandle) -> bool {
    if handle.is_null() {
        return false;
    }
    let handle = &*handle;
    panic::catch_unwind(AssertUnwindSafe(|| handle.client.is_transport_connected()))
        .unwrap_or(false)
}

/// 获取会话 id，未握手时返回 null
///
/// # Safety
/// - `handle` 必须是有效句柄
/// - 调用者负责通过 `tickio_free_string` 释放返回的字符串
#[no_mangle]
pub unsafe extern "C" fn tickio_sid(handle: *const TickioHandle) -> *mut c_char {
    if handle.is_null() {
        return ptr::null_mut();
    }
    let handle = &*handle;
    panic::catch_unwind(AssertUnwindSafe(|| match handle.client.sid() {
        Some(sid) => string_to_cstring(&sid),
        None => ptr::null_mut(),
    }))
    .unwrap_or(ptr::null_mut())
}

// ==================== 事件订阅 ====================

/// 订阅事件，返回用于 `tickio_off` 的 token，失败时返回 0
///
/// # Safety
/// - `handle` 必须是有效句柄
/// - `event` 必须是有效的 UTF-8 C 字符串
/// - `user_data` 在取消订阅前必须保持有效，可为 null
#[no_mangle]
pub unsafe extern "C" fn tickio_on(
    handle: *mut TickioHandle,
    event: *const c_char,
    callback: Option<TickioEventCallback>,
    user_data: *mut c_void,
) -> u64 {
    let Some(callback) = callback else {
        return 0;
    };
    if handle.is_null() || event.is_null() {
        return 0;
    }
    let handle = &*handle;

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let name = to_str(event)?.to_string();
        let handler = event_handler(callback, UserData(user_data));
        handle.client.on(&name, handler.clone());

        let token = handle.next_token.fetch_add(1, Ordering::SeqCst);
        lock(&handle.subscriptions).insert(token, (name, handler));
        Ok::<u64, TickioError>(token)
    }));

    match result {
        Ok(Ok(token)) => token,
        _ => 0,
    }
}

/// 取消订阅
///
/// # Safety
/// - `handle` 必须是有效句柄
#[no_mangle]
pub unsafe extern "C" fn tickio_off(handle: *mut TickioHandle, token: u64) -> TickioError {
    if handle.is_null() {
        return TickioError::NullPointer;
    }
    let handle = &*handle;
    guard(|| {
        let (name, handler) = lock(&handle.subscriptions)
            .remove(&token)
            .ok_or(TickioError::UnknownToken)?;
        handle.client.off(&name, &handler);
        Ok(())
    })
}

fn event_handler(callback: TickioEventCallback, user_data: UserData) -> Handler {
    Arc::new(move |event: &SocketIoEvent| {
        let Ok(name) = CString::new(event.name()) else {
            return;
        };
        let data = event.data().and_then(|d| CString::new(d.to_string()).ok());
        let data_ptr = data.as_ref().map_or(ptr::null(), |d| d.as_ptr());
        callback(name.as_ptr(), data_ptr, user_data.get());
    })
}

// ==================== 上行事件 ====================

/// 发送事件
///
/// # Safety
/// - `handle` 必须是有效句柄
/// - `event` 必须是有效的 UTF-8 C 字符串
/// - `json_data` 可为 null（不带数据），否则必须是有效 JSON
#[no_mangle]
pub unsafe extern "C" fn tickio_emit(
    handle: *mut TickioHandle,
    event: *const c_char,
    json_data: *const c_char,
) -> TickioError {
    if handle.is_null() || event.is_null() {
        return TickioError::NullPointer;
    }
    let handle = &*handle;
    guard(|| {
        let name = to_str(event)?;
        match parse_data(json_data)? {
            Some(data) => handle.client.emit_with_data(name, data)?,
            None => handle.client.emit(name)?,
        }
        Ok(())
    })
}

/// 发送事件并在 tick 中接收服务器回执
///
/// # Safety
/// - `handle` 必须是有效句柄
/// - `event` 必须是有效的 UTF-8 C 字符串
/// - `json_data` 可为 null（不带数据），否则必须是有效 JSON
/// - `user_data` 在回调触发或过期前必须保持有效
/// - `out_packet_id` 可为 null
#[no_mangle]
pub unsafe extern "C" fn tickio_emit_with_ack(
    handle: *mut TickioHandle,
    event: *const c_char,
    json_data: *const c_char,
    callback: Option<TickioAckCallback>,
    user_data: *mut c_void,
    out_packet_id: *mut u64,
) -> TickioError {
    let Some(callback) = callback else {
        return TickioError::NullPointer;
    };
    if handle.is_null() || event.is_null() {
        return TickioError::NullPointer;
    }
    let handle = &*handle;
    guard(|| {
        let name = to_str(event)?;
        let user_data = UserData(user_data);
        let on_ack = move |payload: serde_json::Value| {
            if let Ok(json) = CString::new(payload.to_string()) {
                callback(json.as_ptr(), user_data.get());
            }
        };
        let packet_id = match parse_data(json_data)? {
            Some(data) => handle.client.emit_with_data_and_ack(name, data, on_ack)?,
            None => handle.client.emit_with_ack(name, on_ack)?,
        };
        if !out_packet_id.is_null() {
            *out_packet_id = packet_id;
        }
        Ok(())
    })
}

// ==================== Tick ====================

/// 交付积压的事件和 Ack 回调，宿主每帧调用一次
///
/// # Safety
/// - `handle` 必须是有效句柄
/// - `out_report` 可为 null
#[no_mangle]
pub unsafe extern "C" fn tickio_tick(
    handle: *mut TickioHandle,
    out_report: *mut TickioTickReport,
) -> TickioError {
    if handle.is_null() {
        return TickioError::NullPointer;
    }
    let handle = &*handle;
    guard(|| {
        let report = handle.client.tick();
        if !out_report.is_null() {
            *out_report = report.into();
        }
        Ok(())
    })
}

// ==================== 内存管理 ====================

/// 释放由本库返回的字符串
///
/// # Safety
/// - `s` 必须是本库函数返回的字符串指针
/// - 只能调用一次
#[no_mangle]
pub unsafe extern "C" fn tickio_free_string(s: *mut c_char) {
    if !s.is_null() {
        let _ = CString::from_raw(s);
    }
}

// ==================== 版本信息 ====================

/// 获取库版本号
///
/// # 返回
/// - 返回静态版本字符串，不需要释放
#[no_mangle]
pub extern "C" fn tickio_version() -> *const c_char {
    static VERSION: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();
    VERSION.as_ptr() as *const c_char
}

// ==================== 内部辅助函数 ====================

fn guard<F>(f: F) -> TickioError
where
    F: FnOnce() -> Result<(), TickioError>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => TickioError::Success,
        Ok(Err(e)) => e,
        Err(_) => {
            error!("[tickio-ffi] Panic caught at FFI boundary");
            TickioError::Unknown
        }
    }
}

unsafe fn to_str<'a>(s: *const c_char) -> Result<&'a str, TickioError> {
    CStr::from_ptr(s)
        .to_str()
        .map_err(|_| TickioError::InvalidUtf8)
}

unsafe fn parse_data(json_data: *const c_char) -> Result<Option<serde_json::Value>, TickioError> {
    if json_data.is_null() {
        return Ok(None);
    }
    serde_json::from_str(to_str(json_data)?)
        .map(Some)
        .map_err(|_| TickioError::InvalidJson)
}

fn string_to_cstring(s: &str) -> *mut c_char {
    match CString::new(s) {
        Ok(cs) => cs.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "ws://127.0.0.1:1/socket.io/?EIO=3&transport=websocket";

    extern "C" fn record_event(event: *const c_char, data: *const c_char, user_data: *mut c_void) {
        let log = unsafe { &*(user_data as *const Mutex<Vec<String>>) };
        let name = unsafe { CStr::from_ptr(event) }.to_str().unwrap().to_string();
        let entry = if data.is_null() {
            name
        } else {
            format!("{}:{}", name, unsafe { CStr::from_ptr(data) }.to_str().unwrap())
        };
        log.lock().unwrap().push(entry);
    }

    extern "C" fn ignore_ack(_data: *const c_char, _user_data: *mut c_void) {}

    unsafe fn create(options: Option<&str>) -> *mut TickioHandle {
        let url = CString::new(URL).unwrap();
        let options = options.map(|o| CString::new(o).unwrap());
        let mut handle: *mut TickioHandle = ptr::null_mut();
        let code = tickio_create(
            url.as_ptr(),
            options.as_ref().map_or(ptr::null(), |o| o.as_ptr()),
            &mut handle,
        );
        assert_eq!(code, TickioError::Success);
        assert!(!handle.is_null());
        handle
    }

    #[test]
    fn test_null_pointers_are_rejected() {
        unsafe {
            let mut handle: *mut TickioHandle = ptr::null_mut();
            assert_eq!(
                tickio_create(ptr::null(), ptr::null(), &mut handle),
                TickioError::NullPointer
            );
            assert_eq!(tickio_connect(ptr::null_mut()), TickioError::NullPointer);
            assert_eq!(tickio_tick(ptr::null_mut(), ptr::null_mut()), TickioError::NullPointer);
            assert!(!tickio_is_connected(ptr::null()));
            assert!(tickio_sid(ptr::null()).is_null());
            tickio_destroy(ptr::null_mut());
        }
    }

    #[test]
    fn test_invalid_url_and_options() {
        unsafe {
            let mut handle: *mut TickioHandle = ptr::null_mut();
            let url = CString::new("http://localhost").unwrap();
            assert_eq!(
                tickio_create(url.as_ptr(), ptr::null(), &mut handle),
                TickioError::InvalidConfig
            );

            let url = CString::new(URL).unwrap();
            let options = CString::new("{not json").unwrap();
            assert_eq!(
                tickio_create(url.as_ptr(), options.as_ptr(), &mut handle),
                TickioError::InvalidJson
            );
            assert!(handle.is_null());
        }
    }

    #[test]
    fn test_options_map_onto_config() {
        let options: FfiOptions = serde_json::from_str(
            r#"{
                "auto_connect": true,
                "reconnect_delay_ms": 250,
                "ping_timeout_ms": 1000,
                "headers": {"Authorization": "Bearer t"},
                "tls": {"danger_accept_invalid_certs": true}
            }"#,
        )
        .unwrap();
        let config = options.into_config(URL);

        assert!(config.auto_connect);
        assert_eq!(config.reconnect_delay, Duration::from_millis(250));
        assert_eq!(config.ping_timeout, Duration::from_millis(1000));
        assert_eq!(config.ack_expiration, Duration::from_secs(30));
        assert_eq!(
            config.headers,
            vec![("Authorization".to_string(), "Bearer t".to_string())]
        );
        assert!(config.tls.danger_accept_invalid_certs);
    }

    #[test]
    fn test_emit_while_disconnected_reports_error_in_tick() {
        unsafe {
            let handle = create(None);
            let log = Mutex::new(Vec::<String>::new());
            let event = CString::new("error").unwrap();
            let token = tickio_on(
                handle,
                event.as_ptr(),
                Some(record_event),
                &log as *const _ as *mut c_void,
            );
            assert_ne!(token, 0);

            let beep = CString::new("beep").unwrap();
            assert_eq!(
                tickio_emit(handle, beep.as_ptr(), ptr::null()),
                TickioError::NotConnected
            );
            // 回调只在 tick 中触发
            assert!(log.lock().unwrap().is_empty());

            let mut report = TickioTickReport::default();
            assert_eq!(tickio_tick(handle, &mut report), TickioError::Success);
            assert_eq!(report.events, 1);
            {
                let log = log.lock().unwrap();
                assert_eq!(log.len(), 1);
                assert!(log[0].starts_with("error:"));
                assert!(log[0].contains("transport_send"));
            }

            assert_eq!(tickio_off(handle, token), TickioError::Success);
            assert_eq!(tickio_off(handle, token), TickioError::UnknownToken);
            tickio_destroy(handle);
        }
    }

    #[test]
    fn test_emit_rejects_bad_json_and_missing_callback() {
        unsafe {
            let handle = create(None);
            let event = CString::new("chat").unwrap();
            let bad = CString::new("{oops").unwrap();
            assert_eq!(
                tickio_emit(handle, event.as_ptr(), bad.as_ptr()),
                TickioError::InvalidJson
            );

            let mut packet_id = 0u64;
            assert_eq!(
                tickio_emit_with_ack(
                    handle,
                    event.as_ptr(),
                    ptr::null(),
                    None,
                    ptr::null_mut(),
                    &mut packet_id
                ),
                TickioError::NullPointer
            );
            assert_eq!(
                tickio_emit_with_ack(
                    handle,
                    event.as_ptr(),
                    ptr::null(),
                    Some(ignore_ack),
                    ptr::null_mut(),
                    &mut packet_id
                ),
                TickioError::NotConnected
            );
            assert_eq!(packet_id, 0);
            tickio_destroy(handle);
        }
    }

    #[test]
    fn test_connect_and_close() {
        unsafe {
            let handle = create(Some(r#"{"reconnect_delay_ms": 50}"#));
            assert!(tickio_sid(handle).is_null());
            assert_eq!(tickio_connect(handle), TickioError::Success);
            assert_eq!(tickio_close(handle), TickioError::Success);
            assert_eq!(tickio_close(handle), TickioError::Success);
            assert!(!tickio_is_connected(handle));
            tickio_destroy(handle);
        }
    }

    #[test]
    fn test_version() {
        let version = tickio_version();
        assert!(!version.is_null());
        unsafe {
            let s = CStr::from_ptr(version).to_str().unwrap();
            assert_eq!(s, env!("CARGO_PKG_VERSION"));
        }
    }
}
