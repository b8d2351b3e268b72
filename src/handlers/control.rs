//! Control-channel handler (spec.md §4.9, §6): service discovery, channel
//! open, audio/video/nav focus, night mode, ping/pong.

use crate::message::ChannelId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    W800H480,
    W1280H720,
    W1920H1080,
    W2560H1440,
    W3840H2160,
}

impl Resolution {
    pub fn dims(self) -> (u32, u32) {
        match self {
            Resolution::W800H480 => (800, 480),
            Resolution::W1280H720 => (1280, 720),
            Resolution::W1920H1080 => (1920, 1080),
            Resolution::W2560H1440 => (2560, 1440),
            Resolution::W3840H2160 => (3840, 2160),
        }
    }

    /// spec.md §6's resolution -> dpi default table.
    pub fn default_dpi(self) -> u32 {
        match self {
            Resolution::W800H480 => 160,
            Resolution::W1280H720 => 240,
            Resolution::W1920H1080 => 320,
            Resolution::W2560H1440 => 480,
            Resolution::W3840H2160 => 640,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Margins {
    pub top: u32,
    pub bottom: u32,
    pub left: u32,
    pub right: u32,
}

#[derive(Debug, Clone)]
pub struct VideoServiceConfig {
    pub resolution: Resolution,
    pub fps: u32,
    pub dpi: u32,
    pub margins: Margins,
}

impl VideoServiceConfig {
    /// Computes letterbox margins and the dpi scale-down spec.md §6
    /// requires when `preserve_aspect_ratio` is set: margins are added to
    /// `user_margins`, and dpi is scaled by `effective_height / display_height`.
    pub fn negotiate(
        resolution: Resolution,
        preserve_aspect_ratio: bool,
        source_aspect: f64,
        user_margins: Margins,
        manual_dpi: u32,
    ) -> VideoServiceConfig {
        let (width, height) = resolution.dims();
        let mut margins = user_margins;
        let mut dpi = if manual_dpi != 0 {
            manual_dpi
        } else {
            resolution.default_dpi()
        };

        if preserve_aspect_ratio && source_aspect > 0.0 {
            let display_aspect = width as f64 / height as f64;
            if source_aspect < display_aspect {
                // pillarbox: source is narrower than display
                let effective_width = (height as f64 * source_aspect).round() as u32;
                let bar = (width.saturating_sub(effective_width)) / 2;
                margins.left += bar;
                margins.right += bar;
            } else if source_aspect > display_aspect {
                // letterbox: source is wider than display
                let effective_height = (width as f64 / source_aspect).round() as u32;
                let bar = (height.saturating_sub(effective_height)) / 2;
                margins.top += bar;
                margins.bottom += bar;
                if manual_dpi == 0 && effective_height > 0 {
                    dpi = ((dpi as f64) * (effective_height as f64 / height as f64)).round() as u32;
                }
            }
        }

        VideoServiceConfig {
            resolution,
            fps: 30,
            dpi,
            margins,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceDiscoveryResponse {
    pub service_ids: Vec<u8>,
    pub video: VideoServiceConfig,
}

impl ServiceDiscoveryResponse {
    /// The wire encoding for the body of `ServiceDiscoveryResponse` is not
    /// specified beyond "enumerate the exact set of services" (the real
    /// protobuf schema is explicitly out of scope); this crate uses a
    /// small internal tag-length encoding: `count(u8), ids[count],
    /// video.width(u16), video.height(u16), video.fps(u8), video.dpi(u16)`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.service_ids.len() + 7);
        out.push(self.service_ids.len() as u8);
        out.extend_from_slice(&self.service_ids);
        let (w, h) = self.video.resolution.dims();
        out.extend_from_slice(&(w as u16).to_be_bytes());
        out.extend_from_slice(&(h as u16).to_be_bytes());
        out.push(self.video.fps as u8);
        out.extend_from_slice(&(self.video.dpi as u16).to_be_bytes());
        out
    }
}

/// Builds the service-id list per spec.md §6's table: BLUETOOTH (8) is
/// omitted entirely when `bluetooth_mac` is empty.
pub fn negotiated_service_ids(bluetooth_mac: &str) -> Vec<u8> {
    let mut ids = vec![
        ChannelId::CONTROL.0,
        ChannelId::SENSOR.0,
        ChannelId::VIDEO.0,
        ChannelId::INPUT.0,
        ChannelId::AUDIO_SPEECH.0,
        ChannelId::AUDIO_SYSTEM.0,
        ChannelId::AUDIO_MEDIA.0,
        ChannelId::MIC.0,
    ];
    if !bluetooth_mac.is_empty() {
        ids.push(ChannelId::BLUETOOTH.0);
    }
    ids.push(ChannelId::MUSIC_PLAYBACK.0);
    ids
}

/// Audio-focus grant decision. spec.md §9: `GAIN_TRANSIENT` is granted
/// locally; this engine never calls into an OS audio manager.
pub struct ControlHandler {
    pub bluetooth_mac: String,
}

impl ControlHandler {
    pub fn new(bluetooth_mac: String) -> Self {
        ControlHandler { bluetooth_mac }
    }

    pub fn service_discovery_response(&self, video: VideoServiceConfig) -> ServiceDiscoveryResponse {
        ServiceDiscoveryResponse {
            service_ids: negotiated_service_ids(&self.bluetooth_mac),
            video,
        }
    }
}
