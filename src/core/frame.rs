use bytes::Bytes;

/// Transport-neutral websocket frame type.
///
/// Transports convert their native frame representation into/from `WsFrame`, so this is the
/// only frame type the supervisor, dispatcher and send loop ever see.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WsFrame {
    Text(Bytes),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<WsCloseFrame>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WsCloseFrame {
    pub code: u16,
    pub reason: Bytes,
}

/// Discriminant of a [`WsFrame`], used for logging and counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Text,
    Binary,
    Ping,
    Pong,
    Close,
}

impl WsFrame {
    #[inline]
    pub fn text_static(s: &'static str) -> Self {
        Self::Text(Bytes::from_static(s.as_bytes()))
    }

    #[inline]
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(Bytes::from(s.into()))
    }

    #[inline]
    pub fn binary_static(b: &'static [u8]) -> Self {
        Self::Binary(Bytes::from_static(b))
    }

    #[inline]
    pub fn close(code: u16, reason: Bytes) -> Self {
        Self::Close(Some(WsCloseFrame { code, reason }))
    }

    #[inline]
    pub fn kind(&self) -> FrameKind {
        match self {
            WsFrame::Text(_) => FrameKind::Text,
            WsFrame::Binary(_) => FrameKind::Binary,
            WsFrame::Ping(_) => FrameKind::Ping,
            WsFrame::Pong(_) => FrameKind::Pong,
            WsFrame::Close(_) => FrameKind::Close,
        }
    }

    /// Ping, pong and close frames never reach the application callback.
    #[inline]
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            WsFrame::Ping(_) | WsFrame::Pong(_) | WsFrame::Close(_)
        )
    }
}

/// Borrow the underlying bytes from frames without allocation.
#[inline]
pub fn frame_bytes(frame: &WsFrame) -> Option<&Bytes> {
    match frame {
        WsFrame::Text(bytes) => Some(bytes),
        WsFrame::Binary(bytes) => Some(bytes),
        WsFrame::Ping(bytes) => Some(bytes),
        WsFrame::Pong(bytes) => Some(bytes),
        WsFrame::Close(_) => None,
    }
}

/// Convert owned bytes into a `WsFrame`, preferring text when bytes are valid UTF-8.
#[inline]
pub fn into_ws_frame<B>(bytes: B) -> WsFrame
where
    B: Into<Bytes>,
{
    let payload = bytes.into();
    if std::str::from_utf8(payload.as_ref()).is_ok() {
        WsFrame::Text(payload)
    } else {
        WsFrame::Binary(payload)
    }
}
