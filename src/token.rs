/// Identifies a [`Channel`](crate::Channel) registration with the
/// [`Poller`](crate::Poller).
///
/// Grounded on mio's `Token` (`src/token.rs` in the modern, post-1.0 form):
/// a transparent `usize` newtype carried in the low bits of the
/// `epoll_event.u64` field and handed back unchanged by `epoll_wait`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Token(pub usize);

impl From<Token> for usize {
    fn from(token: Token) -> usize {
        token.0
    }
}

impl From<usize> for Token {
    fn from(val: usize) -> Token {
        Token(val)
    }
}
