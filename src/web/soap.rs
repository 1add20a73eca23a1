//! SOAP 1.1 control endpoint: envelope parsing via `quick_xml::de`,
//! service dispatch by `SOAPACTION` URN, and Fault encoding.

use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use std::net::SocketAddr;
use tracing::debug;

use crate::config::strip_zone;
use crate::directory::{self, didl};
use crate::error::UpnpError;
use crate::state::AppState;

const CONTENT_TYPE_XML: &str = r#"text/xml; charset="utf-8""#;

#[derive(Deserialize)]
struct Envelope<T> {
    #[serde(rename = "Body")]
    body: T,
}

#[derive(Deserialize)]
struct BrowseBody {
    #[serde(rename = "Browse")]
    browse: BrowseRequest,
}

#[derive(Deserialize, Debug, PartialEq, Eq)]
enum BrowseFlag {
    BrowseDirectChildren,
    BrowseMetadata,
}

#[derive(Deserialize, Debug)]
struct BrowseRequest {
    #[serde(rename = "ObjectID")]
    object_id: String,
    #[serde(rename = "BrowseFlag")]
    browse_flag: BrowseFlag,
    #[serde(rename = "Filter", default)]
    filter: String,
    #[serde(rename = "StartingIndex", default)]
    starting_index: usize,
    #[serde(rename = "RequestedCount", default)]
    requested_count: usize,
}

#[derive(Deserialize)]
struct SearchBody {
    #[serde(rename = "Search")]
    search: SearchRequest,
}

#[derive(Deserialize, Debug)]
struct SearchRequest {
    #[serde(rename = "ContainerID")]
    container_id: String,
    #[serde(rename = "SearchCriteria", default)]
    search_criteria: String,
    #[serde(rename = "Filter", default)]
    filter: String,
    #[serde(rename = "StartingIndex", default)]
    starting_index: usize,
    #[serde(rename = "RequestedCount", default)]
    requested_count: usize,
}

fn soap_response(action: &str, service_urn: &str, body_inner: String) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/"><s:Body><u:{action}Response xmlns:u="{service_urn}">{body_inner}</u:{action}Response></s:Body></s:Envelope>"#
    )
}

fn soap_fault(err: UpnpError) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/"><s:Body><s:Fault><faultcode>s:Client</faultcode><faultstring>UPnPError</faultstring><detail><UPnPError xmlns="urn:schemas-upnp-org:control-1-0"><errorCode>{}</errorCode><errorDescription>{}</errorDescription></UPnPError></detail></s:Fault></s:Body></s:Envelope>"#,
        err.code, err.description
    )
}

fn xml_ok(body: String) -> Response {
    (StatusCode::OK, [("Content-Type", CONTENT_TYPE_XML)], body).into_response()
}

fn xml_fault(err: UpnpError) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, [("Content-Type", CONTENT_TYPE_XML)], soap_fault(err)).into_response()
}

fn soap_action(headers: &HeaderMap) -> Option<(String, String)> {
    let raw = headers.get("SOAPACTION")?.to_str().ok()?.trim().trim_matches('"');
    let (urn, action) = raw.rsplit_once('#')?;
    Some((urn.to_string(), action.to_string()))
}

async fn handle_browse(state: &AppState, body: &str) -> Response {
    let envelope: Result<Envelope<BrowseBody>, _> = quick_xml::de::from_str(body);
    let Ok(envelope) = envelope else {
        return xml_fault(UpnpError::INVALID_ARGS);
    };
    let req = envelope.body.browse;
    debug!(object_id = %req.object_id, flag = ?req.browse_flag, "Browse");

    let objects = match req.browse_flag {
        BrowseFlag::BrowseMetadata => {
            match directory::lookup(&state.config, &state.probe_cache, &state.config.friendly_name, &req.object_id).await {
                Some(obj) => vec![obj],
                None => return xml_fault(UpnpError::NO_SUCH_OBJECT),
            }
        }
        BrowseFlag::BrowseDirectChildren => {
            match directory::browse_direct_children(&state.config, &state.probe_cache, &req.object_id).await {
                Ok(objs) => objs,
                Err(_) => return xml_fault(UpnpError::NO_SUCH_OBJECT),
            }
        }
    };

    let total = objects.len();
    let page: Vec<_> = if req.requested_count == 0 {
        objects.into_iter().skip(req.starting_index).collect()
    } else {
        objects.into_iter().skip(req.starting_index).take(req.requested_count).collect()
    };
    let number_returned = page.len();
    let didl = didl::marshal(&page, &req.filter);

    let inner = format!(
        "<Result>{}</Result><NumberReturned>{number_returned}</NumberReturned><TotalMatches>{total}</TotalMatches><UpdateID>0</UpdateID>",
        quick_xml::escape::escape(&didl)
    );
    xml_ok(soap_response("Browse", "urn:schemas-upnp-org:service:ContentDirectory:1", inner))
}

async fn handle_search(state: &AppState, body: &str) -> Response {
    let envelope: Result<Envelope<SearchBody>, _> = quick_xml::de::from_str(body);
    let Ok(envelope) = envelope else {
        return xml_fault(UpnpError::INVALID_ARGS);
    };
    let req = envelope.body.search;
    debug!(container_id = %req.container_id, criteria = %req.search_criteria, "Search");

    let objects = match directory::search(&state.config, &state.probe_cache, &req.container_id, &req.search_criteria).await {
        Ok(objs) => objs,
        Err(_) => return xml_fault(UpnpError::NO_SUCH_OBJECT),
    };

    let total = objects.len();
    let page: Vec<_> = if req.requested_count == 0 {
        objects.into_iter().skip(req.starting_index).collect()
    } else {
        objects.into_iter().skip(req.starting_index).take(req.requested_count).collect()
    };
    let number_returned = page.len();
    let didl = didl::marshal(&page, &req.filter);

    let inner = format!(
        "<Result>{}</Result><NumberReturned>{number_returned}</NumberReturned><TotalMatches>{total}</TotalMatches><UpdateID>0</UpdateID>",
        quick_xml::escape::escape(&didl)
    );
    xml_ok(soap_response("Search", "urn:schemas-upnp-org:service:ContentDirectory:1", inner))
}

fn handle_get_search_capabilities() -> Response {
    xml_ok(soap_response(
        "GetSearchCapabilities",
        "urn:schemas-upnp-org:service:ContentDirectory:1",
        "<SearchCaps>upnp:class</SearchCaps>".to_string(),
    ))
}

fn handle_get_sort_capabilities() -> Response {
    xml_ok(soap_response(
        "GetSortCapabilities",
        "urn:schemas-upnp-org:service:ContentDirectory:1",
        "<SortCaps>dc:title</SortCaps>".to_string(),
    ))
}

fn handle_get_system_update_id() -> Response {
    xml_ok(soap_response(
        "GetSystemUpdateID",
        "urn:schemas-upnp-org:service:ContentDirectory:1",
        "<Id>0</Id>".to_string(),
    ))
}

fn handle_x_get_feature_list() -> Response {
    let features = r#"&lt;Features xmlns=&quot;urn:schemas-upnp-org:av:avs&quot;&gt;&lt;Feature name=&quot;samsung.com_BASICVIEW&quot; version=&quot;1&quot;&gt;&lt;container id=&quot;0&quot; type=&quot;object.item.videoItem&quot;/&gt;&lt;container id=&quot;0&quot; type=&quot;object.item.audioItem&quot;/&gt;&lt;container id=&quot;0&quot; type=&quot;object.item.imageItem&quot;/&gt;&lt;/Feature&gt;&lt;/Features&gt;"#;
    xml_ok(soap_response(
        "X_GetFeatureList",
        "urn:schemas-upnp-org:service:ContentDirectory:1",
        format!("<FeatureList>{features}</FeatureList>"),
    ))
}

fn handle_x_set_bookmark() -> Response {
    xml_ok(soap_response(
        "X_SetBookmark",
        "urn:schemas-upnp-org:service:ContentDirectory:1",
        String::new(),
    ))
}

fn handle_connection_manager_action(action: &str) -> Response {
    let urn = "urn:schemas-upnp-org:service:ConnectionManager:1";
    match action {
        "GetProtocolInfo" => xml_ok(soap_response(
            "GetProtocolInfo",
            urn,
            "<Source>http-get:*:*:*</Source><Sink></Sink>".to_string(),
        )),
        "GetCurrentConnectionIDs" => xml_ok(soap_response("GetCurrentConnectionIDs", urn, "<ConnectionIDs>0</ConnectionIDs>".to_string())),
        "GetCurrentConnectionInfo" => xml_ok(soap_response(
            "GetCurrentConnectionInfo",
            urn,
            "<RcsID>-1</RcsID><AVTransportID>-1</AVTransportID><ProtocolInfo></ProtocolInfo><PeerConnectionManager></PeerConnectionManager><PeerConnectionID>-1</PeerConnectionID><Direction>Output</Direction><Status>OK</Status>".to_string(),
        )),
        _ => xml_fault(UpnpError::INVALID_ACTION),
    }
}

fn handle_media_receiver_registrar_action(action: &str) -> Response {
    let urn = "urn:microsoft.com:service:X_MS_MediaReceiverRegistrar:1";
    match action {
        "IsAuthorized" | "IsValidated" => xml_ok(soap_response(action, urn, "<Result>1</Result>".to_string())),
        "RegisterDevice" => xml_ok(soap_response(action, urn, "<RegistrationRespMsg></RegistrationRespMsg>".to_string())),
        _ => xml_fault(UpnpError::INVALID_ACTION),
    }
}

pub async fn control(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let peer_ip: std::net::IpAddr = strip_zone(&peer.ip().to_string()).parse().unwrap_or(peer.ip());
    if !state.config.is_allowed(peer_ip) {
        return (StatusCode::FORBIDDEN, "forbidden").into_response();
    }

    let Some((urn, action)) = soap_action(&headers) else {
        return xml_fault(UpnpError::INVALID_ACTION);
    };
    debug!(%urn, %action, "SOAP dispatch");

    match urn.as_str() {
        "urn:schemas-upnp-org:service:ContentDirectory:1" => match action.as_str() {
            "Browse" => handle_browse(&state, &body).await,
            "Search" => handle_search(&state, &body).await,
            "GetSearchCapabilities" => handle_get_search_capabilities(),
            "GetSortCapabilities" => handle_get_sort_capabilities(),
            "GetSystemUpdateID" => handle_get_system_update_id(),
            "X_GetFeatureList" => handle_x_get_feature_list(),
            "X_SetBookmark" => handle_x_set_bookmark(),
            _ => xml_fault(UpnpError::INVALID_ACTION),
        },
        "urn:schemas-upnp-org:service:ConnectionManager:1" => handle_connection_manager_action(&action),
        "urn:microsoft.com:service:X_MS_MediaReceiverRegistrar:1" => handle_media_receiver_registrar_action(&action),
        _ => xml_fault(UpnpError::INVALID_ACTION),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_soapaction_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "SOAPACTION",
            "\"urn:schemas-upnp-org:service:ContentDirectory:1#Browse\"".parse().unwrap(),
        );
        let (urn, action) = soap_action(&headers).unwrap();
        assert_eq!(urn, "urn:schemas-upnp-org:service:ContentDirectory:1");
        assert_eq!(action, "Browse");
    }

    #[test]
    fn parses_browse_envelope() {
        let body = r#"<?xml version="1.0"?><s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"><s:Body><u:Browse xmlns:u="urn:schemas-upnp-org:service:ContentDirectory:1"><ObjectID>0</ObjectID><BrowseFlag>BrowseDirectChildren</BrowseFlag><Filter>*</Filter><StartingIndex>0</StartingIndex><RequestedCount>0</RequestedCount></u:Browse></s:Body></s:Envelope>"#;
        let envelope: Envelope<BrowseBody> = quick_xml::de::from_str(body).unwrap();
        assert_eq!(envelope.body.browse.object_id, "0");
        assert_eq!(envelope.body.browse.browse_flag, BrowseFlag::BrowseDirectChildren);
    }
}
