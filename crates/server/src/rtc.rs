use anyhow::{Context, Result};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice::network_type::NetworkType;
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::interceptor::registry::Registry;

use crate::config::WebrtcConfig;

/// Receive MTU for both sides. The default is too small for the datagrams
/// some engines emit on the muxed RTP/RTCP path.
const RECEIVE_MTU: usize = 8192;

/// The two WebRTC stacks the spy uses.
///
/// Backend and browser peer connections need different ICE policies: the
/// backend legs face the engine on a trusted network and advertise the
/// configured 1-to-1 NAT addresses from a bounded UDP port range; the
/// browser side keeps interface candidates (IPv4 UDP only) unless its own
/// advertise list is set.
pub struct RtcApis {
    pub backend: API,
    pub browser: API,
}

pub fn build(config: &WebrtcConfig) -> Result<RtcApis> {
    Ok(RtcApis {
        backend: build_backend_api(config)?,
        browser: build_browser_api(config)?,
    })
}

fn base_media() -> Result<(MediaEngine, Registry)> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .context("Failed to register default codecs")?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)
        .context("Failed to register default interceptors")?;
    Ok((media_engine, registry))
}

fn build_backend_api(config: &WebrtcConfig) -> Result<API> {
    let (media_engine, registry) = base_media()?;

    let mut setting = SettingEngine::default();
    setting.set_receive_mtu(RECEIVE_MTU);
    if !config.nat_1to1_ips.is_empty() {
        setting.set_nat_1to1_ips(config.nat_1to1_ips.clone(), RTCIceCandidateType::Host);
    }
    if config.min_port != 0 || config.max_port != 0 {
        let ephemeral = EphemeralUDP::new(config.min_port, config.max_port)
            .context("Invalid webrtc port range")?;
        setting.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
    }

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .with_setting_engine(setting)
        .build())
}

fn build_browser_api(config: &WebrtcConfig) -> Result<API> {
    let (media_engine, registry) = base_media()?;

    let mut setting = SettingEngine::default();
    setting.set_receive_mtu(RECEIVE_MTU);
    setting.set_network_types(vec![NetworkType::Udp4]);
    if !config.browser_nat_1to1_ips.is_empty() {
        setting.set_nat_1to1_ips(
            config.browser_nat_1to1_ips.clone(),
            RTCIceCandidateType::Host,
        );
    }

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .with_setting_engine(setting)
        .build())
}
