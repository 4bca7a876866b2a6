//! Channel catalog: loads the static `channels.conf` text file describing
//! the channels the zapper knows how to tune, matching the fixed fields the
//! original scanner's `Channel` struct carried.

use std::path::Path;

use anyhow::{Context, Result};

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Channel {
    pub number: String,
    pub name: String,
    pub frequency: String,
    pub service_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct ChannelCatalog {
    channels: Vec<Channel>,
}

impl ChannelCatalog {
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading channel catalog {}", path.display()))?;
        Ok(Self {
            channels: parse_channels_conf(&content)?,
        })
    }

    pub fn all(&self) -> &[Channel] {
        &self.channels
    }

    pub fn find_by_number(&self, number: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.number == number)
    }

    /// Every distinct tuning frequency across the catalog, in file order,
    /// deduplicated the way the guide scanner walks unique muxes.
    pub fn unique_frequencies(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for channel in &self.channels {
            if !seen.contains(&channel.frequency.as_str()) {
                seen.push(channel.frequency.as_str());
            }
        }
        seen
    }

    /// The first channel tuned to `frequency`. The scan driver tunes by
    /// channel name/number (the capture tool looks frequency up from
    /// `channels.conf` itself), so scanning a mux needs any one channel that
    /// lives on it.
    pub fn first_on_frequency(&self, frequency: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.frequency == frequency)
    }
}

/// Parse `number|name|frequency|service_id` pipe-delimited lines. Blank
/// lines and lines starting with `#` are ignored.
fn parse_channels_conf(content: &str) -> Result<Vec<Channel>> {
    let mut channels = Vec::new();

    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let fields: Vec<&str> = line.split('|').collect();
        let [number, name, frequency, service_id] = fields.as_slice() else {
            anyhow::bail!("channels.conf line {}: expected 4 pipe-delimited fields, got {}", lineno + 1, fields.len());
        };

        channels.push(Channel {
            number: number.trim().to_string(),
            name: name.trim().to_string(),
            frequency: frequency.trim().to_string(),
            service_id: service_id.trim().to_string(),
        });
    }

    Ok(channels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pipe_delimited_lines() {
        let data = "\
# comment
5.1|WABC HD|563000000|1
5.2|WABC SD|563000000|2
";
        let channels = parse_channels_conf(data).unwrap();
        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0].number, "5.1");
        assert_eq!(channels[0].name, "WABC HD");
        assert_eq!(channels[1].service_id, "2");
    }

    #[test]
    fn rejects_malformed_line() {
        let data = "5.1|WABC HD|563000000\n";
        assert!(parse_channels_conf(data).is_err());
    }

    #[test]
    fn unique_frequencies_deduplicates_in_order() {
        let data = "\
5.1|WABC HD|563000000|1
5.2|WABC SD|563000000|2
7.1|WNBC HD|177000000|3
";
        let catalog = ChannelCatalog {
            channels: parse_channels_conf(data).unwrap(),
        };
        assert_eq!(catalog.unique_frequencies(), vec!["563000000", "177000000"]);
    }

    #[test]
    fn first_on_frequency_picks_the_earliest_match() {
        let data = "\
5.1|WABC HD|563000000|1
5.2|WABC SD|563000000|2
";
        let catalog = ChannelCatalog {
            channels: parse_channels_conf(data).unwrap(),
        };
        assert_eq!(catalog.first_on_frequency("563000000").unwrap().number, "5.1");
        assert!(catalog.first_on_frequency("999").is_none());
    }
}
