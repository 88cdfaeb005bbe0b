//! Transport driver: bridges an async byte stream to the engine.
//!
//! The engine itself is synchronous; this future owns the transport and
//! one network, moving bytes both ways and running the timeout scan on a
//! coarse timer. TLS composes by handing a TLS stream in as `T`.

use std::future::Future;
use std::io::IoSlice;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::ready;
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep, Instant, Sleep};

use crate::error::Error;
use crate::net::Network;
use crate::Result;

const TICK: Duration = Duration::from_secs(1);
const READ_SIZE: usize = 16 * 1024;

pin_project! {
    /// Drives one transport connection to completion.
    pub struct Connection<T> {
        #[pin]
        io: T,
        net: Network,
        read_buf: Vec<u8>,
        read_closed: bool,
        #[pin]
        timer: Sleep,
    }
}

impl<T> Connection<T> {
    pub fn new(io: T, net: Network) -> Connection<T> {
        Connection {
            io,
            net,
            read_buf: vec![0u8; READ_SIZE],
            read_closed: false,
            timer: sleep(TICK),
        }
    }

    /// The engine state, e.g. for installing notifiers before polling.
    pub fn network_mut(&mut self) -> &mut Network {
        &mut self.net
    }
}

impl<T> Future for Connection<T>
where
    T: AsyncRead + AsyncWrite,
{
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        loop {
            // Notifications reach observers through the notifier; the
            // buffered copies would otherwise accumulate for the life of
            // the connection.
            let _ = this.net.take_events();
            // Flush pending egress with vectored writes.
            let mut wrote = false;
            while this.net.has_wire() {
                let result = {
                    let mut slices = [IoSlice::new(&[]); 16];
                    let n = this.net.wire_vectored(&mut slices);
                    this.io.as_mut().poll_write_vectored(cx, &slices[..n])
                };
                match result {
                    Poll::Ready(Ok(0)) => {
                        return Poll::Ready(Err(Error::new_io(std::io::Error::new(
                            std::io::ErrorKind::WriteZero,
                            "transport write returned zero",
                        ))));
                    }
                    Poll::Ready(Ok(written)) => {
                        this.net.wire_advance(written);
                        wrote = true;
                    }
                    Poll::Ready(Err(err)) => return Poll::Ready(Err(Error::new_io(err))),
                    Poll::Pending => break,
                }
            }
            if wrote && !this.net.has_wire() {
                this.net.wire_flushed();
                if this.net.has_wire() {
                    continue;
                }
            }

            if this.net.is_closing() && !this.net.has_wire() {
                ready!(this.io.as_mut().poll_shutdown(cx)).map_err(Error::new_io)?;
                return Poll::Ready(Ok(()));
            }

            // Pull transport bytes while the engine will take them.
            if !*this.read_closed && this.net.wants_read() {
                let mut buf = ReadBuf::new(this.read_buf.as_mut_slice());
                match this.io.as_mut().poll_read(cx, &mut buf) {
                    Poll::Ready(Ok(())) => {
                        if buf.filled().is_empty() {
                            *this.read_closed = true;
                            this.net.input_eof();
                        } else {
                            let n = buf.filled().len();
                            let data = &this.read_buf[..n];
                            this.net.input(data);
                        }
                        continue;
                    }
                    Poll::Ready(Err(err)) => return Poll::Ready(Err(Error::new_io(err))),
                    Poll::Pending => {}
                }
            }

            if this.timer.as_mut().poll(cx).is_ready() {
                this.net.tick(std::time::Instant::now());
                this.timer.as_mut().reset(Instant::now() + TICK);
                continue;
            }
            return Poll::Pending;
        }
    }
}
