//! DIDL-Lite XML marshaling for `Browse`/`Search` responses.
//!
//! Built with the same `format!`-templated approach the teacher's
//! `web::xml` uses for its DIDL fragments, rather than a runtime XML tree
//! builder — DIDL-Lite's shape here is fixed enough that templating reads
//! more plainly than a builder API would.

use super::{Object, Resource};

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

/// Whether a DIDL field is included under the SOAP `Filter` parameter:
/// `*` includes everything, otherwise a comma-separated allowlist.
struct Filter<'a> {
    all: bool,
    fields: Vec<&'a str>,
}

impl<'a> Filter<'a> {
    fn parse(filter: &'a str) -> Self {
        let trimmed = filter.trim();
        if trimmed.is_empty() || trimmed == "*" {
            Filter { all: true, fields: Vec::new() }
        } else {
            Filter {
                all: false,
                fields: trimmed.split(',').map(|s| s.trim()).collect(),
            }
        }
    }

    fn includes(&self, field: &str) -> bool {
        self.all || self.fields.contains(&field)
    }
}

fn marshal_resource(res: &Resource, filter: &Filter) -> String {
    let mut attrs = format!(r#"protocolInfo="{}""#, xml_escape(&res.protocol_info));
    if filter.includes("res@size") {
        if let Some(size) = res.size {
            attrs.push_str(&format!(r#" size="{size}""#));
        }
    }
    if filter.includes("res@duration") {
        if let Some(d) = res.duration_secs {
            attrs.push_str(&format!(r#" duration="{}""#, crate::npt::format_npt(std::time::Duration::from_secs_f64(d))));
        }
    }
    if filter.includes("res@resolution") {
        if let Some((w, h)) = res.resolution {
            attrs.push_str(&format!(r#" resolution="{w}x{h}""#));
        }
    }
    if filter.includes("res@sampleFrequency") {
        if let Some(sf) = res.sample_frequency {
            attrs.push_str(&format!(r#" sampleFrequency="{sf}""#));
        }
    }
    if filter.includes("res@nrAudioChannels") {
        if let Some(ch) = res.nr_audio_channels {
            attrs.push_str(&format!(r#" nrAudioChannels="{ch}""#));
        }
    }
    format!("<res {attrs}>{}</res>", xml_escape(&res.url))
}

fn marshal_object(object: &Object, filter: &Filter) -> String {
    if object.is_container() {
        return format!(
            r#"<container id="{id}" parentID="{parent}" restricted="1" searchable="1"><dc:title>{title}</dc:title><upnp:class>{class}</upnp:class></container>"#,
            id = xml_escape(&object.id),
            parent = xml_escape(&object.parent_id),
            title = xml_escape(&object.title),
            class = object.class.upnp_class(),
        );
    }

    let resources: String = object
        .resources
        .iter()
        .map(|r| marshal_resource(r, filter))
        .collect();

    let subtitle = if filter.includes("res") {
        object
            .subtitle_url
            .as_ref()
            .map(|u| format!(r#"<sec:CaptionInfoEx sec:type="srt">{}</sec:CaptionInfoEx>"#, xml_escape(u)))
            .unwrap_or_default()
    } else {
        String::new()
    };

    format!(
        r#"<item id="{id}" parentID="{parent}" restricted="1"><dc:title>{title}</dc:title><upnp:class>{class}</upnp:class>{resources}{subtitle}</item>"#,
        id = xml_escape(&object.id),
        parent = xml_escape(&object.parent_id),
        title = xml_escape(&object.title),
        class = object.class.upnp_class(),
    )
}

/// Marshals a list of objects into a complete DIDL-Lite document, honoring
/// `filter` for resource attributes, and applying the Samsung
/// compatibility fix afterward.
pub fn marshal(objects: &[Object], filter_str: &str) -> String {
    let filter = Filter::parse(filter_str);
    let mut out = String::from(
        r#"<DIDL-Lite xmlns="urn:schemas-upnp-org:metadata-1-0/DIDL-Lite/" xmlns:dc="http://purl.org/dc/elements/1.1/" xmlns:upnp="urn:schemas-upnp-org:metadata-1-0/upnp/" xmlns:sec="http://www.sec.co.kr/">"#,
    );
    for object in objects {
        out.push_str(&marshal_object(object, &filter));
    }
    out.push_str("</DIDL-Lite>");
    fix_samsung_quoting(&out)
}

/// Marshals a single object (used by `BrowseMetadata`).
pub fn marshal_one(object: &Object, filter_str: &str) -> String {
    marshal(std::slice::from_ref(object), filter_str)
}

/// Samsung Frame TVs fail to parse a `res` tag whose `protocolInfo`
/// attribute contains an escaped `&#34;` entity (produced when a
/// protocolInfo string legitimately contains a literal `"`, which never
/// happens here, but some renderers choke on the escaped form regardless
/// of whether it was needed) — replace it back to a literal quote as a
/// required, narrowly scoped compatibility fix.
fn fix_samsung_quoting(didl: &str) -> String {
    didl.replace("&#34;", "\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::ObjectClass;

    fn sample_item() -> Object {
        Object {
            id: "Movies/foo.mkv".into(),
            title: "foo.mkv".into(),
            class: ObjectClass::VideoItem,
            parent_id: "Movies".into(),
            resources: vec![Resource {
                protocol_info: "http-get:*:video/x-matroska:DLNA.ORG_CI=0".into(),
                url: "/res?path=Movies%2Ffoo.mkv".into(),
                size: Some(1024),
                duration_secs: Some(60.0),
                resolution: Some((1920, 1080)),
                sample_frequency: None,
                nr_audio_channels: None,
            }],
            subtitle_url: None,
        }
    }

    #[test]
    fn marshal_contains_expected_fields() {
        let didl = marshal(&[sample_item()], "*");
        assert!(didl.contains("<DIDL-Lite"));
        assert!(didl.contains("foo.mkv"));
        assert!(didl.contains(r#"size="1024""#));
        assert!(didl.contains(r#"resolution="1920x1080""#));
        assert!(!didl.contains("&#34;"));
    }

    #[test]
    fn filter_excludes_unlisted_resource_attributes() {
        let didl = marshal(&[sample_item()], "dc:title");
        assert!(!didl.contains("size="));
        assert!(!didl.contains("resolution="));
    }

    #[test]
    fn container_marshals_without_resources() {
        let container = Object {
            id: "Movies".into(),
            title: "Movies".into(),
            class: ObjectClass::StorageFolder,
            parent_id: "0".into(),
            resources: vec![],
            subtitle_url: None,
        };
        let didl = marshal(&[container], "*");
        assert!(didl.contains("<container"));
        assert!(!didl.contains("<res"));
    }
}
