//! Timeseries database generation detection
//!
//! Two incompatible CLI generations are deployed in the field. The running
//! one is found by asking the database's ping endpoint for its version.

use semver::Version;
use std::time::Duration;
use tracing::{debug, warn};

use crate::utils::{
    PlatformSettings, TIMESERIES_LEGACY_MOUNT, TIMESERIES_MOUNT, TIMESERIES_PROBE_TIMEOUT_SECS,
    TIMESERIES_VERSION_HEADER,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    /// 1.x, `influxd backup -portable`
    V1,
    /// 2.x, `influx backup` with an admin token
    V2,
}

/// Map a reported version string to its generation
pub fn classify(version: &str) -> Option<Generation> {
    let trimmed = version.trim().trim_start_matches('v');
    let major = match Version::parse(trimmed) {
        Ok(parsed) => parsed.major,
        // Pre-release builds report things like "2.7" or "1.8.10-c1.8.10"
        Err(_) => trimmed.split('.').next()?.parse().ok()?,
    };

    match major {
        1 => Some(Generation::V1),
        2 => Some(Generation::V2),
        _ => None,
    }
}

/// Container, mount point and commands for one generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeseriesTarget {
    pub generation: Generation,
    pub container: String,
    pub mount: String,
}

impl TimeseriesTarget {
    pub fn for_generation(generation: Generation, platform: &PlatformSettings) -> Self {
        match generation {
            Generation::V2 => Self {
                generation,
                container: platform.timeseries_database.clone(),
                mount: TIMESERIES_MOUNT.to_string(),
            },
            Generation::V1 => Self {
                generation,
                container: platform.timeseries_legacy_database.clone(),
                mount: TIMESERIES_LEGACY_MOUNT.to_string(),
            },
        }
    }

    pub fn dump_command(&self, dump_dir: &str, token: Option<&str>) -> String {
        let target = format!("{}/{}", self.mount, dump_dir);
        match (self.generation, token) {
            (Generation::V2, Some(token)) => format!("influx backup {} -t {}", target, token),
            (Generation::V2, None) => format!("influx backup {}", target),
            (Generation::V1, _) => format!("influxd backup -portable {}", target),
        }
    }

    pub fn restore_command(&self, dump_dir: &str) -> String {
        let source = format!("{}/{}", self.mount, dump_dir);
        match self.generation {
            Generation::V2 => format!("influx restore {} --full", source),
            Generation::V1 => format!("influxd restore -portable {}", source),
        }
    }

    pub fn remove_command(&self, dump_dir: &str) -> String {
        format!("rm -rf {}/{}", self.mount, dump_dir)
    }
}

/// Ask the ping endpoint which generation is running
///
/// Unreachable databases and unknown versions both yield `None`.
pub async fn probe(ping_url: &str) -> Option<Generation> {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(TIMESERIES_PROBE_TIMEOUT_SECS))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "failed to build probe client");
            return None;
        }
    };

    let response = match client.get(ping_url).send().await {
        Ok(response) => response,
        Err(e) => {
            debug!(url = ping_url, error = %e, "timeseries database not reachable");
            return None;
        }
    };

    let version = response
        .headers()
        .get(TIMESERIES_VERSION_HEADER)
        .and_then(|value| value.to_str().ok())?
        .to_string();
    let generation = classify(&version);
    debug!(version = %version, ?generation, "timeseries database version");
    generation
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[test]
    fn test_classify() {
        assert_eq!(classify("v2.7.1"), Some(Generation::V2));
        assert_eq!(classify("2.7"), Some(Generation::V2));
        assert_eq!(classify("1.8.10"), Some(Generation::V1));
        assert_eq!(classify("1.8.10-c1.8.10"), Some(Generation::V1));
        assert_eq!(classify("3.0.0"), None);
        assert_eq!(classify("unknown"), None);
        assert_eq!(classify(""), None);
    }

    #[test]
    fn test_commands_per_generation() {
        let platform = PlatformSettings::default();

        let v2 = TimeseriesTarget::for_generation(Generation::V2, &platform);
        assert_eq!(v2.container, "influxdb2");
        assert_eq!(
            v2.dump_command("influxdbdump-t1", Some("tok")),
            "influx backup /var/lib/influxdb2/influxdbdump-t1 -t tok"
        );
        assert_eq!(
            v2.restore_command("influxdbdump-t1"),
            "influx restore /var/lib/influxdb2/influxdbdump-t1 --full"
        );

        let v1 = TimeseriesTarget::for_generation(Generation::V1, &platform);
        assert_eq!(v1.container, "influxdb");
        assert_eq!(
            v1.dump_command("influxdbdump-t1", Some("ignored")),
            "influxd backup -portable /var/lib/influxdb/influxdbdump-t1"
        );
        assert_eq!(v1.remove_command("influxdbdump-t1"), "rm -rf /var/lib/influxdb/influxdbdump-t1");
    }

    #[tokio::test]
    async fn test_probe_reads_version_header() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/ping");
                then.status(204).header("X-Influxdb-Version", "v2.7.4");
            })
            .await;

        assert_eq!(probe(&server.url("/ping")).await, Some(Generation::V2));
    }

    #[tokio::test]
    async fn test_probe_without_header_is_none() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/ping");
                then.status(204);
            })
            .await;

        assert_eq!(probe(&server.url("/ping")).await, None);
    }
}
