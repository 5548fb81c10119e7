//! Descriptor hand-off over Unix stream sockets
//!
//! File descriptors ride as `SCM_RIGHTS` ancillary data on the first chunk of
//! an ordinary frame. The receiver gets new descriptors for the same kernel
//! objects; the sender's descriptors stay open.

use crate::frame::{encode_frame, read_payload, HEADER_LEN};
use crate::serial::Serial;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

/// Most descriptors accepted alongside one frame
pub const MAX_FDS: usize = 4;

/// Send `serial` as one frame with `fds` attached
pub fn send_frame_with_fds(
    stream: &UnixStream,
    serial: &Serial,
    fds: &[BorrowedFd<'_>],
) -> io::Result<()> {
    let frame = encode_frame(serial);
    let raw: Vec<RawFd> = fds.iter().map(|fd| fd.as_raw_fd()).collect();
    let cmsgs = if raw.is_empty() {
        vec![]
    } else {
        vec![ControlMessage::ScmRights(&raw)]
    };

    let sent = sendmsg::<()>(
        stream.as_raw_fd(),
        &[IoSlice::new(&frame)],
        &cmsgs,
        MsgFlags::empty(),
        None,
    )
    .map_err(io::Error::from)?;

    if sent == 0 {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            "sendmsg wrote 0 bytes",
        ));
    }
    // Ancillary data is delivered with the first chunk only.
    if sent < frame.len() {
        (&*stream).write_all(&frame[sent..])?;
    }
    Ok(())
}

/// Receive one frame and any descriptors attached to it
pub fn recv_frame_with_fds(stream: &UnixStream) -> io::Result<(Serial, Vec<OwnedFd>)> {
    let mut header = [0u8; HEADER_LEN];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; MAX_FDS]);

    let (received, fds) = {
        let mut iov = [IoSliceMut::new(&mut header)];
        let msg = recvmsg::<()>(
            stream.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buffer),
            MsgFlags::MSG_CMSG_CLOEXEC,
        )
        .map_err(io::Error::from)?;

        let mut fds = Vec::new();
        for cmsg in msg.cmsgs().map_err(io::Error::from)? {
            if let ControlMessageOwned::ScmRights(raw) = cmsg {
                // SAFETY: the kernel installed these descriptors for us and nothing else owns them.
                fds.extend(raw.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
            }
        }
        (msg.bytes, fds)
    };

    if received == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "peer closed before sending a frame",
        ));
    }
    if received < HEADER_LEN {
        (&*stream).read_exact(&mut header[received..])?;
    }

    let serial = read_payload(&mut &*stream, header)?;
    Ok((serial, fds))
}
