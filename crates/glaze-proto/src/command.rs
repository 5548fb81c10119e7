//! Opcodes and typed requests
//!
//! Every message starts with an `i32` opcode followed by the opcode-specific
//! payload. Window rectangles and texture dimensions travel as count-prefixed
//! arrays whose arity is validated on decode.

use crate::error::ProtocolError;
use crate::serial::Serial;
use std::fmt;

/// Identifier of a live entry in the broker's object table
pub type Handle = u64;

// ============================================================================
// Opcodes
// ============================================================================

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    NewWindow = 1,
    ModifyWindow = 2,
    CloseWindow = 3,
    Texture = 4,
    ShmTexture = 5,
    ShmParams = 6,
    NewConnection = 7,
}

impl Opcode {
    pub const ALL: [Opcode; 7] = [
        Opcode::NewWindow,
        Opcode::ModifyWindow,
        Opcode::CloseWindow,
        Opcode::Texture,
        Opcode::ShmTexture,
        Opcode::ShmParams,
        Opcode::NewConnection,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Opcode::NewWindow => "new_window",
            Opcode::ModifyWindow => "modify_window",
            Opcode::CloseWindow => "close_window",
            Opcode::Texture => "texture",
            Opcode::ShmTexture => "shm_texture",
            Opcode::ShmParams => "shm_params",
            Opcode::NewConnection => "new_connection",
        }
    }

    /// Whether executing this opcode changes what is on screen
    pub fn affects_windows(self) -> bool {
        matches!(
            self,
            Opcode::NewWindow | Opcode::ModifyWindow | Opcode::CloseWindow | Opcode::Texture
        )
    }
}

impl TryFrom<i32> for Opcode {
    type Error = ProtocolError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Opcode::ALL
            .into_iter()
            .find(|op| *op as i32 == value)
            .ok_or(ProtocolError::UnknownOpcode(value))
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", *self as i32, self.as_str())
    }
}

// ============================================================================
// Payload types
// ============================================================================

/// Window rectangle in surface pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self { x, y, w, h }
    }

    pub fn to_array(self) -> [i32; 4] {
        [self.x, self.y, self.w, self.h]
    }

    pub fn from_array([x, y, w, h]: [i32; 4]) -> Self {
        Self { x, y, w, h }
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.x, self.y, self.w, self.h)
    }
}

/// Where a `texture` request's pixels live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelSource {
    /// Count-prefixed byte array following the dimensions
    Inline,
    /// Payload of the texture-data segment
    Segment,
}

/// Number of RGBA bytes a `width` x `height` texture must supply
pub fn expected_pixel_len(width: i32, height: i32) -> Result<usize, ProtocolError> {
    if width <= 0 || height <= 0 {
        return Err(ProtocolError::InvalidDimensions { width, height });
    }
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|n| n.checked_mul(4))
        .ok_or(ProtocolError::InvalidDimensions { width, height })
}

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    NewWindow(Rect),
    ModifyWindow {
        handle: Handle,
        rect: Rect,
    },
    CloseWindow {
        handle: Handle,
    },
    Texture {
        handle: Handle,
        width: i32,
        height: i32,
        /// Present only for `PixelSource::Inline`
        pixels: Option<Vec<u8>>,
    },
    ShmTexture,
    ShmParams,
    NewConnection,
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::NewWindow(_) => Opcode::NewWindow,
            Request::ModifyWindow { .. } => Opcode::ModifyWindow,
            Request::CloseWindow { .. } => Opcode::CloseWindow,
            Request::Texture { .. } => Opcode::Texture,
            Request::ShmTexture => Opcode::ShmTexture,
            Request::ShmParams => Opcode::ShmParams,
            Request::NewConnection => Opcode::NewConnection,
        }
    }

    pub fn encode(&self) -> Serial {
        let mut serial = Serial::new();
        serial.append(self.opcode() as i32);
        match self {
            Request::NewWindow(rect) => {
                serial.append_bytes(&rect.to_array());
            }
            Request::ModifyWindow { handle, rect } => {
                serial.append(*handle).append_bytes(&rect.to_array());
            }
            Request::CloseWindow { handle } => {
                serial.append(*handle);
            }
            Request::Texture {
                handle,
                width,
                height,
                pixels,
            } => {
                serial.append(*handle).append_bytes(&[*width, *height]);
                if let Some(pixels) = pixels {
                    serial.append_bytes(pixels);
                }
            }
            Request::ShmTexture | Request::ShmParams | Request::NewConnection => {}
        }
        serial
    }

    /// Decode a request from the start of `serial`
    pub fn decode(serial: &mut Serial, source: PixelSource) -> Result<Self, ProtocolError> {
        let opcode = Opcode::try_from(serial.read::<i32>()?)?;
        let request = match opcode {
            Opcode::NewWindow => {
                Request::NewWindow(Rect::from_array(serial.read_array("window rectangle")?))
            }
            Opcode::ModifyWindow => {
                let handle = serial.read::<Handle>()?;
                let rect = Rect::from_array(serial.read_array("window rectangle")?);
                Request::ModifyWindow { handle, rect }
            }
            Opcode::CloseWindow => Request::CloseWindow {
                handle: serial.read()?,
            },
            Opcode::Texture => {
                let handle = serial.read::<Handle>()?;
                let [width, height] = serial.read_array::<i32, 2>("texture dimensions")?;
                let pixels = match source {
                    PixelSource::Inline => Some(serial.read_raw()?.to_vec()),
                    PixelSource::Segment => None,
                };
                Request::Texture {
                    handle,
                    width,
                    height,
                    pixels,
                }
            }
            Opcode::ShmTexture => Request::ShmTexture,
            Opcode::ShmParams => Request::ShmParams,
            Opcode::NewConnection => Request::NewConnection,
        };
        Ok(request)
    }
}

// ============================================================================
// Replies
// ============================================================================

/// Reply to `new_window`
pub fn encode_handle(handle: Handle) -> Serial {
    let mut serial = Serial::new();
    serial.append(handle);
    serial
}

pub fn decode_handle(serial: &mut Serial) -> Result<Handle, ProtocolError> {
    serial.read()
}

/// Reply to `shm_texture` / `shm_params`; the descriptor travels out of band
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentInfo {
    pub size: u64,
    pub references: u64,
}

impl SegmentInfo {
    pub fn encode(&self) -> Serial {
        let mut serial = Serial::new();
        serial.append(self.size).append(self.references);
        serial
    }

    pub fn decode(serial: &mut Serial) -> Result<Self, ProtocolError> {
        Ok(Self {
            size: serial.read()?,
            references: serial.read()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(request: &Request, source: PixelSource) -> Request {
        let mut serial = Serial::from_bytes(request.encode().into_bytes());
        let decoded = Request::decode(&mut serial, source).unwrap();
        assert_eq!(serial.remaining(), 0, "{} left bytes behind", request.opcode());
        decoded
    }

    #[test]
    fn test_roundtrip_every_opcode() {
        let requests = [
            Request::NewWindow(Rect::new(0, 0, 100, 100)),
            Request::ModifyWindow {
                handle: 3,
                rect: Rect::new(-10, 10, 50, 50),
            },
            Request::CloseWindow { handle: 9 },
            Request::Texture {
                handle: 1,
                width: 2,
                height: 1,
                pixels: Some(vec![1, 2, 3, 4, 5, 6, 7, 8]),
            },
            Request::ShmTexture,
            Request::ShmParams,
            Request::NewConnection,
        ];

        let covered: Vec<Opcode> = requests.iter().map(Request::opcode).collect();
        assert_eq!(covered, Opcode::ALL);

        for request in &requests {
            assert_eq!(&roundtrip(request, PixelSource::Inline), request);
        }
    }

    #[test]
    fn test_texture_from_segment_has_no_inline_pixels() {
        let request = Request::Texture {
            handle: 4,
            width: 8,
            height: 8,
            pixels: None,
        };
        assert_eq!(roundtrip(&request, PixelSource::Segment), request);
    }

    #[test]
    fn test_short_rectangle_rejected() {
        let mut serial = Serial::new();
        serial.append(Opcode::NewWindow as i32).append_bytes(&[1i32, 2, 3]);
        let err = Request::decode(&mut serial, PixelSource::Inline).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::Arity {
                field: "window rectangle",
                expected: 4,
                found: 3
            }
        );
    }

    #[test]
    fn test_long_rectangle_rejected() {
        let mut serial = Serial::new();
        serial
            .append(Opcode::ModifyWindow as i32)
            .append(0u64)
            .append_bytes(&[1i32, 2, 3, 4, 5]);
        assert!(matches!(
            Request::decode(&mut serial, PixelSource::Inline),
            Err(ProtocolError::Arity { found: 5, .. })
        ));
    }

    #[test]
    fn test_unknown_opcode() {
        let mut serial = Serial::new();
        serial.append(99i32);
        assert_eq!(
            Request::decode(&mut serial, PixelSource::Inline),
            Err(ProtocolError::UnknownOpcode(99))
        );
    }

    #[test]
    fn test_truncated_message() {
        let mut serial = Serial::new();
        serial.append(Opcode::CloseWindow as i32).append(1u16);
        assert!(matches!(
            Request::decode(&mut serial, PixelSource::Inline),
            Err(ProtocolError::Underrun { .. })
        ));
    }

    #[test]
    fn test_expected_pixel_len() {
        assert_eq!(expected_pixel_len(2, 3), Ok(24));
        assert_eq!(
            expected_pixel_len(0, 3),
            Err(ProtocolError::InvalidDimensions {
                width: 0,
                height: 3
            })
        );
        assert!(expected_pixel_len(-1, 5).is_err());
    }

    #[test]
    fn test_reply_roundtrip() {
        let mut handle = Serial::from_bytes(encode_handle(7).into_bytes());
        assert_eq!(decode_handle(&mut handle), Ok(7));

        let info = SegmentInfo {
            size: 4096,
            references: 2,
        };
        let mut serial = Serial::from_bytes(info.encode().into_bytes());
        assert_eq!(SegmentInfo::decode(&mut serial), Ok(info));
    }
}
