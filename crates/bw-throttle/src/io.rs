//! [`AsyncRead`] support for [`ThrottledReader`].

use futures::{io::AsyncRead, ready, Future};
use std::io::Result as IoResult;
use std::pin::Pin;
use std::task::{Context, Poll};

use tor_rtcompat::Runtime;

use crate::ThrottledReader;

impl<R: Runtime> AsyncRead for ThrottledReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<IoResult<usize>> {
        let mut this = self.project();

        loop {
            {
                let waiting_for = this.waiting_for.as_mut().as_pin_mut();
                if let Some(waiting_for) = waiting_for {
                    let () = ready!(waiting_for.poll(cx)); // return if waiting.
                }
                this.waiting_for.set(None);
            }

            match this.shared.take_or_listen(|st| st.take_into(buf)) {
                Ok(Ok(n)) => return Poll::Ready(Ok(n)),
                Ok(Err(listener)) => {
                    this.waiting_for.set(Some(listener));
                    // Poll the new listener before returning, so that we're
                    // registered for a wakeup.
                    continue;
                }
                Err(e) => return Poll::Ready(Err(e.into())),
            }
        }
    }
}
