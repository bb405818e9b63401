use crate::queue::RedisEndpoints;
use eyre::{eyre, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration, assembled from CLI flags and their environment
/// fallbacks in `main`.
#[derive(Debug, Clone)]
pub struct SeederConfig {
    /// HTTP port serving the health endpoint.
    pub port: u16,
    pub redis: RedisEndpoints,
    pub sqlite_db_path: PathBuf,

    pub failure_threshold: u32,
    pub breaker_cooldown: Duration,

    pub recovery_chunk_size: usize,
    pub recovery_cooldown: Duration,
    pub recovery_check_interval: Duration,

    /// One car is generated per tick of this interval.
    pub car_interval: Duration,
    pub metrics_log_dir: PathBuf,
}

impl SeederConfig {
    /// In sentinel mode the master is discovered through the quorum;
    /// otherwise host/port are used as-is.
    pub fn redis_endpoints(
        use_sentinel: bool,
        sentinel_hosts: Option<&str>,
        master_name: &str,
        host: &str,
        port: u16,
    ) -> Result<RedisEndpoints> {
        if use_sentinel {
            let hosts = sentinel_hosts
                .ok_or_else(|| eyre!("REDIS_USE_SENTINEL is set but REDIS_SENTINEL_HOSTS is not"))?;
            let sentinels = parse_host_list(hosts)?;
            if sentinels.is_empty() {
                return Err(eyre!("REDIS_SENTINEL_HOSTS is empty"));
            }
            Ok(RedisEndpoints::Sentinel {
                sentinels,
                master_name: master_name.to_string(),
            })
        } else {
            Ok(RedisEndpoints::Direct {
                host: host.to_string(),
                port,
            })
        }
    }

    pub fn sentinel_master_name(&self) -> Option<String> {
        match &self.redis {
            RedisEndpoints::Sentinel { master_name, .. } => Some(master_name.clone()),
            RedisEndpoints::Direct { .. } => None,
        }
    }
}

/// Parses `host:port,host:port,…`.
fn parse_host_list(raw: &str) -> Result<Vec<(String, u16)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (host, port) = entry
                .rsplit_once(':')
                .ok_or_else(|| eyre!("invalid host entry {entry:?}: expected host:port"))?;
            if host.is_empty() {
                return Err(eyre!("invalid host entry {entry:?}: empty host"));
            }
            let port = port
                .parse::<u16>()
                .map_err(|e| eyre!("invalid port in {entry:?}: {e}"))?;
            Ok((host.to_string(), port))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{parse_host_list, SeederConfig};
    use crate::queue::RedisEndpoints;

    #[test]
    fn parses_comma_separated_host_list() {
        let hosts = parse_host_list("s1:26379, s2:26379 ,s3:26380").unwrap();
        assert_eq!(
            hosts,
            vec![
                ("s1".to_string(), 26379),
                ("s2".to_string(), 26379),
                ("s3".to_string(), 26380),
            ]
        );
    }

    #[test]
    fn rejects_malformed_host_entries() {
        assert!(parse_host_list("nohost").is_err());
        assert!(parse_host_list("host:notaport").is_err());
        assert!(parse_host_list(":26379").is_err());
        assert!(parse_host_list("host:99999").is_err());
    }

    #[test]
    fn sentinel_mode_requires_hosts() {
        assert!(SeederConfig::redis_endpoints(true, None, "mymaster", "localhost", 6379).is_err());

        let endpoints =
            SeederConfig::redis_endpoints(true, Some("s1:26379"), "mymaster", "localhost", 6379)
                .unwrap();
        match endpoints {
            RedisEndpoints::Sentinel {
                sentinels,
                master_name,
            } => {
                assert_eq!(sentinels, vec![("s1".to_string(), 26379)]);
                assert_eq!(master_name, "mymaster");
            }
            other => panic!("unexpected endpoints {other:?}"),
        }
    }

    #[test]
    fn direct_mode_uses_host_and_port() {
        let endpoints =
            SeederConfig::redis_endpoints(false, None, "mymaster", "redis.internal", 6380).unwrap();
        match endpoints {
            RedisEndpoints::Direct { host, port } => {
                assert_eq!(host, "redis.internal");
                assert_eq!(port, 6380);
            }
            other => panic!("unexpected endpoints {other:?}"),
        }
    }
}
