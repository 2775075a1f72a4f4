//! Browser viewer for one view
//!
//! The generated script opens a receive-only peer connection, creates the
//! `"data"` and `"clicks"` channels on the same fixed stream ids the server
//! pre-negotiates, posts its offer (base64 JSON, gathered candidates
//! included) to the view's signaling endpoint and applies the answer.
//!
//! Clicks on the video element are reported in video pixel coordinates as
//! `"x,y"`. `window.remoteView<n>.sendCommand(name, args)` sends a command
//! envelope on the data channel; replies are logged to the console.

use serde_json::{json, Value};

use crate::view::RemoteView;
use crate::webrtc::{
    WebRtcConfig, CLICK_CHANNEL_ID, CLICK_CHANNEL_LABEL, DATA_CHANNEL_ID, DATA_CHANNEL_LABEL,
};

const SCRIPT_TEMPLATE: &str = r#"(function () {
  const video = document.getElementById("@VIDEO_ID@");
  const status = document.getElementById("@STATUS_ID@");
  const setStatus = (text) => { if (status) { status.textContent = text; } };

  const pc = new RTCPeerConnection({ iceServers: @ICE_SERVERS@ });
  const data = pc.createDataChannel("@DATA_LABEL@", { negotiated: true, id: @DATA_ID@ });
  const clicks = pc.createDataChannel("@CLICK_LABEL@", { negotiated: true, id: @CLICK_ID@ });
  pc.addTransceiver("video", { direction: "recvonly" });

  pc.ontrack = (event) => { video.srcObject = event.streams[0]; };
  pc.oniceconnectionstatechange = () => setStatus(pc.iceConnectionState);
  data.onmessage = (event) => console.log("@NAME@:", event.data);

  video.addEventListener("click", (event) => {
    if (clicks.readyState !== "open" || !video.videoWidth) { return; }
    const rect = video.getBoundingClientRect();
    const x = (event.clientX - rect.left) * video.videoWidth / rect.width;
    const y = (event.clientY - rect.top) * video.videoHeight / rect.height;
    clicks.send(x + "," + y);
  });

  window["remoteView@NUMBER@"] = {
    peerConnection: pc,
    sendCommand(name, args) {
      data.send(JSON.stringify({ name: name, args: (args || []).map(String) }));
    },
  };

  const gathered = () => new Promise((resolve) => {
    if (pc.iceGatheringState === "complete") { resolve(); return; }
    pc.addEventListener("icegatheringstatechange", () => {
      if (pc.iceGatheringState === "complete") { resolve(); }
    });
  });

  pc.createOffer()
    .then((offer) => pc.setLocalDescription(offer))
    .then(gathered)
    .then(() => fetch("@ENDPOINT@", { method: "POST", body: btoa(JSON.stringify(pc.localDescription)) }))
    .then((resp) => resp.ok ? resp.text() : Promise.reject(new Error("signaling failed: " + resp.status)))
    .then((answer) => pc.setRemoteDescription(JSON.parse(atob(answer.trim()))))
    .catch((err) => { setStatus("error"); console.error(err); });
})();
"#;

const BODY_TEMPLATE: &str = r#"<div class="remote-view">
  <h3>Remote View@TITLE@</h3>
  <video id="@VIDEO_ID@" autoplay muted playsinline></video>
  <div id="@STATUS_ID@">connecting</div>
</div>
"#;

const PAGE_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>Remote View@TITLE@</title>
</head>
<body>
@BODY@<script>
@SCRIPT@</script>
</body>
</html>
"#;

/// Script and markup for embedding a view in an existing page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerPage {
    pub javascript: String,
    pub body: String,
}

impl ViewerPage {
    pub fn for_view(view: &RemoteView) -> Self {
        let config = view.config();
        let number = config.stream_number.to_string();
        let video_id = format!("remote-view-video-{}", number);
        let status_id = format!("remote-view-status-{}", number);
        let title = title_suffix(&config.stream_name);

        let javascript = SCRIPT_TEMPLATE
            .replace("@VIDEO_ID@", &video_id)
            .replace("@STATUS_ID@", &status_id)
            .replace("@ICE_SERVERS@", &ice_servers_json(&config.webrtc).to_string())
            .replace("@DATA_LABEL@", DATA_CHANNEL_LABEL)
            .replace("@DATA_ID@", &DATA_CHANNEL_ID.to_string())
            .replace("@CLICK_LABEL@", CLICK_CHANNEL_LABEL)
            .replace("@CLICK_ID@", &CLICK_CHANNEL_ID.to_string())
            .replace("@NAME@", &format!("remote view {}", number))
            .replace("@NUMBER@", &number)
            .replace("@ENDPOINT@", &format!("/{}", config.handler_name()));

        let body = BODY_TEMPLATE
            .replace("@TITLE@", &title)
            .replace("@VIDEO_ID@", &video_id)
            .replace("@STATUS_ID@", &status_id);

        Self { javascript, body }
    }

    /// Complete standalone document
    pub fn single_page(&self, view: &RemoteView) -> String {
        PAGE_TEMPLATE
            .replace("@TITLE@", &title_suffix(&view.config().stream_name))
            .replace("@BODY@", &self.body)
            .replace("@SCRIPT@", &self.javascript)
    }
}

/// Standalone viewer document for `view`
pub fn single_page_html(view: &RemoteView) -> String {
    ViewerPage::for_view(view).single_page(view)
}

/// `RTCIceServer` list for the browser
///
/// Mirrors the server side, so TURN entries without credentials are left out.
fn ice_servers_json(config: &WebRtcConfig) -> Value {
    let servers = config
        .ice_servers()
        .into_iter()
        .map(|server| {
            let mut entry = json!({ "urls": server.urls });
            if !server.username.is_empty() {
                entry["username"] = json!(server.username);
            }
            if !server.credential.is_empty() {
                entry["credential"] = json!(server.credential);
            }
            entry
        })
        .collect();
    Value::Array(servers)
}

fn title_suffix(name: &str) -> String {
    if name.is_empty() {
        String::new()
    } else {
        format!(" {}", escape_html(name))
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
