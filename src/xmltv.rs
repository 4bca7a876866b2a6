//! XMLTV rendering for the program guide. Grounded on
//! `original_source/src/db.c: db_get_xmltv_programs`, reworked to escape
//! text content (the original's `snprintf` does not) and to key programmes
//! directly by `channel_number` rather than re-deriving it from a service id
//! at render time, since [`crate::epg::ProgramEntry`] already carries it.

use chrono::{DateTime, Utc};

use crate::channels::Channel;
use crate::epg::ProgramEntry;

/// Render an XMLTV document listing `channels` and every entry in `programs`.
pub fn render_xmltv(channels: &[Channel], programs: &[ProgramEntry]) -> String {
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<tv>\n");

    for channel in channels {
        out.push_str(&format!(
            "  <channel id=\"{}\">\n    <display-name>{}</display-name>\n  </channel>\n",
            xml_escape(&channel.number),
            xml_escape(&channel.name),
        ));
    }

    for program in programs {
        out.push_str(&format!(
            "  <programme start=\"{}\" stop=\"{}\" channel=\"{}\">\n    <title>{}</title>\n  </programme>\n",
            format_xmltv_time(program.start_unix_ms),
            format_xmltv_time(program.end_unix_ms),
            xml_escape(&program.channel_number),
            xml_escape(&program.title),
        ));
    }

    out.push_str("</tv>\n");
    out
}

/// `YYYYMMDDHHMMSS +0000`, the XMLTV timestamp format, from a Unix
/// millisecond timestamp.
fn format_xmltv_time(unix_ms: i64) -> String {
    let dt: DateTime<Utc> = DateTime::from_timestamp_millis(unix_ms).unwrap_or_default();
    format!("{} +0000", dt.format("%Y%m%d%H%M%S"))
}

fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(number: &str, name: &str) -> Channel {
        Channel {
            number: number.to_string(),
            name: name.to_string(),
            frequency: "563000000".to_string(),
            service_id: "1".to_string(),
        }
    }

    fn program(channel_number: &str, start_unix_ms: i64, end_unix_ms: i64, title: &str) -> ProgramEntry {
        ProgramEntry {
            channel_number: channel_number.to_string(),
            source_id: 7,
            event_id: 1,
            start_unix_ms,
            end_unix_ms,
            title: title.to_string(),
        }
    }

    #[test]
    fn renders_channel_and_programme_elements() {
        let channels = vec![channel("5.1", "WABC HD")];
        let programs = vec![program("5.1", 0, 1_800_000, "News & Weather")];

        let xml = render_xmltv(&channels, &programs);
        assert!(xml.contains("<channel id=\"5.1\">"));
        assert!(xml.contains("<display-name>WABC HD</display-name>"));
        assert!(xml.contains("News &amp; Weather"));
        assert!(xml.contains("channel=\"5.1\""));
    }

    #[test]
    fn gps_epoch_zero_formats_as_expected_unix_date() {
        // start_unix_ms for GPS start_gps=0 per spec.md §8.10.
        assert_eq!(format_xmltv_time(315_964_782_000), "19800106000000 +0000");
    }

    #[test]
    fn escapes_special_characters_in_titles() {
        let xml = xml_escape("Tom & Jerry: <The \"Cat\"'s Revenge>");
        assert_eq!(xml, "Tom &amp; Jerry: &lt;The &quot;Cat&quot;&apos;s Revenge&gt;");
    }
}
