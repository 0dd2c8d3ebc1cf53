//! Cooperative cancellation shared between a caller and a running
//! export/import.  Checked between chunks of every streaming loop, and
//! cancellable from async tasks and plain threads alike.

pub use tokio_util::sync::CancellationToken as CancelToken;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_observe_cancellation() {
        let token = CancelToken::new();
        let observer = token.clone();
        assert!(!observer.is_cancelled());
        token.cancel();
        assert!(observer.is_cancelled());
    }

    #[test]
    fn children_follow_their_parent() {
        let parent = CancelToken::new();
        let child = parent.child_token();
        let sibling = parent.child_token();
        child.cancel();
        assert!(!parent.is_cancelled());
        assert!(!sibling.is_cancelled());
        parent.cancel();
        assert!(sibling.is_cancelled());
    }
}
