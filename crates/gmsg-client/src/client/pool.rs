// Candidate servers and their reconnect bookkeeping.
use std::time::{Duration, Instant};

use crate::config::ServerUrl;

#[derive(Debug, Clone)]
pub(crate) struct Server {
    pub(crate) url: ServerUrl,
    /// Consecutive failed reconnect attempts since the last success.
    pub(crate) reconnects: usize,
    pub(crate) last_attempt: Option<Instant>,
}

/// Ordered server pool. The current server is always at `current`; when a
/// reconnect starts it rotates to the back, or leaves the pool once it has
/// used up its attempts.
#[derive(Debug)]
pub(crate) struct ServerPool {
    servers: Vec<Server>,
    current: Option<usize>,
}

impl ServerPool {
    pub(crate) fn new(urls: Vec<ServerUrl>) -> Self {
        let servers = urls
            .into_iter()
            .map(|url| Server {
                url,
                reconnects: 0,
                last_attempt: None,
            })
            .collect();
        Self {
            servers,
            current: None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.servers.len()
    }

    pub(crate) fn url(&self, idx: usize) -> Option<ServerUrl> {
        self.servers.get(idx).map(|server| server.url.clone())
    }

    pub(crate) fn urls(&self) -> Vec<ServerUrl> {
        self.servers.iter().map(|server| server.url.clone()).collect()
    }

    pub(crate) fn current_url(&self) -> Option<&ServerUrl> {
        self.current
            .and_then(|idx| self.servers.get(idx))
            .map(|server| &server.url)
    }

    pub(crate) fn record_attempt(&mut self, idx: usize) {
        if let Some(server) = self.servers.get_mut(idx) {
            server.last_attempt = Some(Instant::now());
        }
    }

    pub(crate) fn mark_connected(&mut self, idx: usize) {
        if let Some(server) = self.servers.get_mut(idx) {
            server.reconnects = 0;
            self.current = Some(idx);
        }
    }

    /// Pick the next reconnect candidate and how long to wait before dialing
    /// it. Returns `None` once the pool is exhausted.
    pub(crate) fn next_candidate(
        &mut self,
        max_reconnect: Option<usize>,
        reconnect_wait: Duration,
    ) -> Option<(usize, ServerUrl, Duration)> {
        let current = self.current.unwrap_or(0);
        if current < self.servers.len() {
            let server = self.servers.remove(current);
            if max_reconnect.is_none_or(|max| server.reconnects < max) {
                self.servers.push(server);
            } else {
                tracing::debug!(server = %server.url, "server reached reconnect limit, removing from pool");
            }
        }
        if self.servers.is_empty() {
            self.current = None;
            return None;
        }
        self.current = Some(0);
        let server = &mut self.servers[0];
        server.reconnects += 1;
        let wait = match server.last_attempt {
            Some(at) => reconnect_wait.saturating_sub(at.elapsed()),
            None => Duration::ZERO,
        };
        Some((0, server.url.clone(), wait))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(ports: &[u16]) -> ServerPool {
        ServerPool::new(
            ports
                .iter()
                .map(|port| ServerUrl::parse(&format!("gio://127.0.0.1:{port}")).expect("url"))
                .collect(),
        )
    }

    #[test]
    fn rotation_moves_current_to_back() {
        let mut pool = pool(&[1, 2, 3]);
        pool.mark_connected(0);
        let (_, url, wait) = pool
            .next_candidate(Some(10), Duration::from_millis(100))
            .expect("candidate");
        assert_eq!(url.port, 2);
        assert_eq!(wait, Duration::ZERO);
        let ports: Vec<u16> = pool.urls().iter().map(|url| url.port).collect();
        assert_eq!(ports, vec![2, 3, 1]);

        let (_, url, _) = pool
            .next_candidate(Some(10), Duration::from_millis(100))
            .expect("candidate");
        assert_eq!(url.port, 3);
    }

    #[test]
    fn exhausted_servers_leave_the_pool() {
        let mut pool = pool(&[1, 2]);
        pool.mark_connected(0);
        let mut seen = Vec::new();
        while let Some((_, url, _)) = pool.next_candidate(Some(2), Duration::ZERO) {
            seen.push(url.port);
            assert!(seen.len() < 10, "pool never drained");
        }
        // Server 1 starts at zero attempts, so each server gets two tries.
        assert_eq!(seen, vec![2, 1, 2, 1]);
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn wait_applies_per_server() {
        let mut pool = pool(&[1, 2]);
        pool.record_attempt(1);
        pool.mark_connected(0);
        let (_, url, wait) = pool
            .next_candidate(None, Duration::from_secs(60))
            .expect("candidate");
        assert_eq!(url.port, 2);
        assert!(wait > Duration::from_secs(50));
    }

    #[test]
    fn success_resets_attempts() {
        let mut pool = pool(&[1]);
        pool.mark_connected(0);
        pool.next_candidate(Some(1), Duration::ZERO).expect("candidate");
        pool.mark_connected(0);
        assert!(pool.next_candidate(Some(1), Duration::ZERO).is_some());
        assert_eq!(pool.current_url().map(|url| url.port), Some(1));
    }
}
