//! Connection setup
//!
//! Drives a client from `Initial` through `Authenticating` to `Running`, or
//! closes it with a failure block naming the reason.

use super::client::ClientState;
use super::Server;
use crate::connection::Connection;
use crate::protocol::setup::SetupParseError;
use crate::protocol::*;
use crate::security::AuthDecision;
use log::{debug, info, warn};

/// Reason sent when every client slot is taken
pub const MAX_CLIENTS_REASON: &str = "Maximum number of clients reached";

/// Reason sent for a protocol major version other than 11
pub const VERSION_MISMATCH_REASON: &str = "Protocol version mismatch";

/// Visual advertised for the root depth
const ROOT_VISUAL: VisualID = VisualID(0x21);

const TRUE_COLOR: u8 = 4;

fn failure_block(order: ByteOrder, reason: &str) -> Vec<u8> {
    SetupFailed {
        protocol_major_version: PROTOCOL_MAJOR_VERSION,
        protocol_minor_version: PROTOCOL_MINOR_VERSION,
        reason: reason.to_string(),
    }
    .encode(order)
}

/// Turn away a connection that could not get a slot.
///
/// The reason is sent in the peer's byte order when its order byte has
/// already arrived.
pub(crate) fn refuse_connection(mut conn: Connection, reason: &str) {
    let mut input = Vec::new();
    let _ = conn.read_available(&mut input);
    let order = input
        .first()
        .and_then(|b| OrderByte::parse(*b))
        .map(|o| o.byte_order)
        .unwrap_or(ByteOrder::LSBFirst);
    let mut output = failure_block(order, reason);
    if let Err(e) = conn.write_pending(&mut output) {
        debug!("Could not tell refused client why: {}", e);
    }
    warn!("Refused connection: {}", reason);
}

impl Server {
    /// Run the connection setup for a client in the `Initial` state.
    ///
    /// Returns without changing state while the setup request is incomplete.
    pub(crate) fn handshake(&mut self, id: ClientId) {
        let Some(client) = self.client_mut(id) else {
            return;
        };
        let parsed = SetupRequest::parse(client.input());
        let io_closed = client.io_closed();
        let (setup, used) = match parsed {
            Ok(Some(parsed)) => parsed,
            Ok(None) => {
                if io_closed {
                    debug!("{} went away during setup", id);
                    self.close_down(id);
                }
                return;
            }
            Err(SetupParseError::BadOrderByte(byte)) => {
                warn!("{} sent invalid order byte 0x{:02x}", id, byte);
                self.close_down(id);
                return;
            }
        };
        client.consume_input(used);
        client.set_order(setup.order.byte_order, setup.order.trusted);
        let order = setup.order.byte_order;
        self.set_client_state(id, ClientState::Authenticating);

        if setup.protocol_major_version != PROTOCOL_MAJOR_VERSION {
            self.fail_setup(id, order, VERSION_MISMATCH_REASON);
            return;
        }
        if let AuthDecision::Deny(reason) = self.authorizer.authorize(
            &setup.authorization_protocol_name,
            &setup.authorization_protocol_data,
        ) {
            self.fail_setup(id, order, &reason);
            return;
        }
        if let Err(e) = self.resources.init_client(id, setup.order.trusted) {
            self.fail_setup(id, order, &e.to_string());
            return;
        }

        let reply = self.setup_success(id).encode(order);
        self.send(id, &reply);
        self.client_running(id);
        info!(
            "{} connected ({:?}{})",
            id,
            order,
            if setup.order.trusted { "" } else { ", untrusted" }
        );
    }

    fn fail_setup(&mut self, id: ClientId, order: ByteOrder, reason: &str) {
        warn!("Setup of {} failed: {}", id, reason);
        self.send(id, &failure_block(order, reason));
        self.close_down(id);
    }

    /// Success block for a client, carrying its resource ID range
    pub(crate) fn setup_success(&self, id: ClientId) -> SetupSuccess {
        let layout = self.resources.layout();
        let screen = self.config.screen;
        SetupSuccess {
            protocol_major_version: PROTOCOL_MAJOR_VERSION,
            protocol_minor_version: PROTOCOL_MINOR_VERSION,
            release_number: self.config.release,
            resource_id_base: layout.client_base(id),
            resource_id_mask: layout.id_mask(),
            motion_buffer_size: 256,
            maximum_request_length: u16::MAX,
            image_byte_order: ByteOrder::LSBFirst,
            bitmap_format_bit_order: ByteOrder::LSBFirst,
            bitmap_format_scanline_unit: 32,
            bitmap_format_scanline_pad: 32,
            min_keycode: 8,
            max_keycode: 255,
            vendor: self.config.vendor.clone(),
            pixmap_formats: vec![
                Format {
                    depth: 1,
                    bits_per_pixel: 1,
                    scanline_pad: 32,
                },
                Format {
                    depth: 24,
                    bits_per_pixel: 32,
                    scanline_pad: 32,
                },
                Format {
                    depth: 32,
                    bits_per_pixel: 32,
                    scanline_pad: 32,
                },
            ],
            roots: vec![Screen {
                root: self.root_window(),
                default_colormap: self.default_colormap(),
                white_pixel: 0x00ff_ffff,
                black_pixel: 0,
                current_input_masks: 0,
                width_in_pixels: screen.width,
                height_in_pixels: screen.height,
                width_in_millimeters: screen.width_mm,
                height_in_millimeters: screen.height_mm,
                min_installed_maps: 1,
                max_installed_maps: 1,
                root_visual: ROOT_VISUAL,
                backing_stores: 0,
                save_unders: false,
                root_depth: screen.depth,
                allowed_depths: vec![
                    Depth {
                        depth: screen.depth,
                        visuals: vec![VisualType {
                            visual_id: ROOT_VISUAL,
                            class: TRUE_COLOR,
                            bits_per_rgb_value: 8,
                            colormap_entries: 256,
                            red_mask: 0xff_0000,
                            green_mask: 0x00_ff00,
                            blue_mask: 0x00_00ff,
                        }],
                    },
                    Depth {
                        depth: 1,
                        visuals: Vec::new(),
                    },
                ],
            }],
        }
    }
}
