//! Port allocation for browser subprocesses. In manual mode, ports pop from a
//! configured ordered list and are pushed back on teardown; in auto-assign
//! mode, the OS hands out a free port that is never returned to a pool.

use tokio::net::TcpListener;

use crate::error::PoolError;

pub enum PortPool {
    Manual(Vec<u16>),
    Auto,
}

impl PortPool {
    pub fn new(auto_assign: bool, manual_ports: Vec<u16>) -> Self {
        if auto_assign {
            PortPool::Auto
        } else {
            PortPool::Manual(manual_ports)
        }
    }

    /// Acquire one port for a new instance. Manual mode pops the front of the
    /// configured list; auto mode binds an ephemeral port and immediately
    /// releases the listener so Chrome can bind it.
    pub async fn acquire(&mut self) -> Result<u16, PoolError> {
        match self {
            PortPool::Manual(ports) => {
                if ports.is_empty() {
                    Err(PoolError::NoPortAvailable)
                } else {
                    Ok(ports.remove(0))
                }
            }
            PortPool::Auto => {
                let listener = TcpListener::bind(("127.0.0.1", 0))
                    .await
                    .map_err(|_| PoolError::NoPortAvailable)?;
                let port = listener
                    .local_addr()
                    .map_err(|_| PoolError::NoPortAvailable)?
                    .port();
                drop(listener);
                Ok(port)
            }
        }
    }

    /// Release a port back to the pool. A no-op in auto-assign mode.
    pub fn release(&mut self, port: u16) {
        if let PortPool::Manual(ports) = self {
            ports.push(port);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn manual_pool_pops_and_releases() {
        let mut pool = PortPool::new(false, vec![9001, 9002]);
        let first = pool.acquire().await.unwrap();
        assert_eq!(first, 9001);
        pool.release(first);
        let next = pool.acquire().await.unwrap();
        assert_eq!(next, 9002);
        let reused = pool.acquire().await.unwrap();
        assert_eq!(reused, 9001);
    }

    #[tokio::test]
    async fn manual_pool_exhausts() {
        let mut pool = PortPool::new(false, vec![]);
        assert!(matches!(pool.acquire().await, Err(PoolError::NoPortAvailable)));
    }

    #[tokio::test]
    async fn auto_pool_never_exhausts_and_ignores_release() {
        let mut pool = PortPool::new(true, vec![]);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_ne!(a, b);
        pool.release(a);
    }
}
