//! Task-local correlation IDs.
//!
//! Every logical operation (an import run, a C-STORE batch, a download) gets
//! an 8-character alphanumeric token that tags every log and audit record it
//! produces. Carried as a `tokio::task_local!` value rather than a
//! thread-local so it survives across `.await` points and is explicitly
//! inherited when a pool spawns a worker task (thread-locals silently reset
//! at a pool boundary).

use rand::Rng;

tokio::task_local! {
    static CORRELATION_ID: String;
}

const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Generate a fresh 8-character alphanumeric correlation id.
pub fn generate() -> String {
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Return the correlation id for the current task, generating one lazily if
/// none has been set.
pub fn current() -> String {
    CORRELATION_ID
        .try_with(|id| id.clone())
        .unwrap_or_else(|_| generate())
}

/// Run `f` with `id` installed as the task-local correlation id.
pub async fn with_id<F, Fut, T>(id: String, f: F) -> T
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = T>,
{
    CORRELATION_ID.scope(id, f()).await
}

/// Snapshot the caller's correlation id (generating one if absent) so it can
/// be explicitly handed to a spawned worker task via [`with_id`].
///
/// Call this on the parent task *before* `tokio::spawn`; thread-locals and
/// task-locals are not inherited by a spawned task on their own.
pub fn inherit() -> String {
    current()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_eight_alphanumeric_chars() {
        let id = generate();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[tokio::test]
    async fn current_falls_back_to_a_fresh_id_outside_scope() {
        let id = current();
        assert_eq!(id.len(), 8);
    }

    #[tokio::test]
    async fn scope_propagates_into_awaited_futures() {
        let id = "abcd1234".to_string();
        let seen = with_id(id.clone(), || async { current() }).await;
        assert_eq!(seen, id);
    }

    #[tokio::test]
    async fn inherited_id_survives_into_a_spawned_task() {
        let id = "wrkr0001".to_string();
        let seen = with_id(id.clone(), || async {
            let inherited = inherit();
            tokio::spawn(with_id(inherited, || async { current() }))
                .await
                .unwrap()
        })
        .await;
        assert_eq!(seen, id);
    }
}
