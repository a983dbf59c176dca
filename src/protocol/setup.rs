//! X11 connection setup protocol
//!
//! This module handles the initial connection handshake between client and server.

use super::wire::{WireReader, WireWriter};
use super::*;

/// Length of the fixed connection-setup prefix
pub const SETUP_PREFIX_LEN: usize = 12;

/// Connection setup request from client
#[derive(Debug, Clone)]
pub struct SetupRequest {
    pub order: OrderByte,
    pub protocol_major_version: u16,
    pub protocol_minor_version: u16,
    pub authorization_protocol_name: String,
    pub authorization_protocol_data: Vec<u8>,
}

/// Why a setup prefix could not be decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupParseError {
    /// The first byte is not one of the legal order bytes
    BadOrderByte(u8),
}

impl SetupRequest {
    /// Parse a setup request from the front of `buf`.
    ///
    /// Returns `Ok(None)` while the request is incomplete, otherwise the
    /// request and the number of bytes it occupied.
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>, SetupParseError> {
        let Some(&first) = buf.first() else {
            return Ok(None);
        };
        let order = OrderByte::parse(first).ok_or(SetupParseError::BadOrderByte(first))?;
        if buf.len() < SETUP_PREFIX_LEN {
            return Ok(None);
        }

        let mut reader = WireReader::new(&buf[2..SETUP_PREFIX_LEN], order.byte_order);
        let Ok((major, minor, name_len, data_len)) = read_prefix(&mut reader) else {
            return Ok(None);
        };

        let name_len = name_len as usize;
        let data_len = data_len as usize;
        let total = SETUP_PREFIX_LEN + padded_len(name_len) + padded_len(data_len);
        if buf.len() < total {
            return Ok(None);
        }

        let name_start = SETUP_PREFIX_LEN;
        let data_start = name_start + padded_len(name_len);
        let authorization_protocol_name =
            String::from_utf8_lossy(&buf[name_start..name_start + name_len]).into_owned();
        let authorization_protocol_data = buf[data_start..data_start + data_len].to_vec();

        Ok(Some((
            SetupRequest {
                order,
                protocol_major_version: major,
                protocol_minor_version: minor,
                authorization_protocol_name,
                authorization_protocol_data,
            },
            total,
        )))
    }

    /// Encode a setup request; used by tests and tools that act as a client
    pub fn encode(&self, order_byte: u8) -> Vec<u8> {
        let mut writer = WireWriter::new(self.order.byte_order);
        writer
            .u8(order_byte)
            .u8(0)
            .u16(self.protocol_major_version)
            .u16(self.protocol_minor_version)
            .u16(self.authorization_protocol_name.len() as u16)
            .u16(self.authorization_protocol_data.len() as u16)
            .zeros(2)
            .padded_bytes(self.authorization_protocol_name.as_bytes())
            .padded_bytes(&self.authorization_protocol_data);
        writer.into_inner()
    }
}

fn read_prefix(reader: &mut WireReader<'_>) -> Result<(u16, u16, u16, u16), ProtocolError> {
    Ok((reader.u16()?, reader.u16()?, reader.u16()?, reader.u16()?))
}

/// Setup response status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStatus {
    Failed = 0,
    Success = 1,
    Authenticate = 2,
}

/// Pixmap format information
#[derive(Debug, Clone)]
pub struct Format {
    pub depth: u8,
    pub bits_per_pixel: u8,
    pub scanline_pad: u8,
}

impl Format {
    fn encode(&self, writer: &mut WireWriter) {
        writer
            .u8(self.depth)
            .u8(self.bits_per_pixel)
            .u8(self.scanline_pad)
            .zeros(5);
    }
}

/// Visual type information
#[derive(Debug, Clone)]
pub struct VisualType {
    pub visual_id: VisualID,
    pub class: u8,
    pub bits_per_rgb_value: u8,
    pub colormap_entries: u16,
    pub red_mask: u32,
    pub green_mask: u32,
    pub blue_mask: u32,
}

impl VisualType {
    fn encode(&self, writer: &mut WireWriter) {
        writer
            .u32(self.visual_id.get())
            .u8(self.class)
            .u8(self.bits_per_rgb_value)
            .u16(self.colormap_entries)
            .u32(self.red_mask)
            .u32(self.green_mask)
            .u32(self.blue_mask)
            .zeros(4);
    }
}

/// Depth information
#[derive(Debug, Clone)]
pub struct Depth {
    pub depth: u8,
    pub visuals: Vec<VisualType>,
}

impl Depth {
    fn encode(&self, writer: &mut WireWriter) {
        writer
            .u8(self.depth)
            .u8(0)
            .u16(self.visuals.len() as u16)
            .zeros(4);
        for visual in &self.visuals {
            visual.encode(writer);
        }
    }
}

/// Screen information
#[derive(Debug, Clone)]
pub struct Screen {
    pub root: Window,
    pub default_colormap: Colormap,
    pub white_pixel: u32,
    pub black_pixel: u32,
    pub current_input_masks: u32,
    pub width_in_pixels: u16,
    pub height_in_pixels: u16,
    pub width_in_millimeters: u16,
    pub height_in_millimeters: u16,
    pub min_installed_maps: u16,
    pub max_installed_maps: u16,
    pub root_visual: VisualID,
    pub backing_stores: u8,
    pub save_unders: bool,
    pub root_depth: u8,
    pub allowed_depths: Vec<Depth>,
}

impl Screen {
    fn encode(&self, writer: &mut WireWriter) {
        writer
            .u32(self.root.id().get())
            .u32(self.default_colormap.id().get())
            .u32(self.white_pixel)
            .u32(self.black_pixel)
            .u32(self.current_input_masks)
            .u16(self.width_in_pixels)
            .u16(self.height_in_pixels)
            .u16(self.width_in_millimeters)
            .u16(self.height_in_millimeters)
            .u16(self.min_installed_maps)
            .u16(self.max_installed_maps)
            .u32(self.root_visual.get())
            .u8(self.backing_stores)
            .bool(self.save_unders)
            .u8(self.root_depth)
            .u8(self.allowed_depths.len() as u8);
        for depth in &self.allowed_depths {
            depth.encode(writer);
        }
    }
}

/// Setup reply (success case)
#[derive(Debug, Clone)]
pub struct SetupSuccess {
    pub protocol_major_version: u16,
    pub protocol_minor_version: u16,
    pub release_number: u32,
    pub resource_id_base: u32,
    pub resource_id_mask: u32,
    pub motion_buffer_size: u32,
    pub maximum_request_length: u16,
    pub image_byte_order: ByteOrder,
    pub bitmap_format_bit_order: ByteOrder,
    pub bitmap_format_scanline_unit: u8,
    pub bitmap_format_scanline_pad: u8,
    pub min_keycode: u8,
    pub max_keycode: u8,
    pub vendor: String,
    pub pixmap_formats: Vec<Format>,
    pub roots: Vec<Screen>,
}

impl SetupSuccess {
    pub fn encode(&self, byte_order: ByteOrder) -> Vec<u8> {
        let mut writer = WireWriter::new(byte_order);
        writer
            .u8(SetupStatus::Success as u8)
            .u8(0)
            .u16(self.protocol_major_version)
            .u16(self.protocol_minor_version)
            .u16(0) // length, patched below
            .u32(self.release_number)
            .u32(self.resource_id_base)
            .u32(self.resource_id_mask)
            .u32(self.motion_buffer_size)
            .u16(self.vendor.len() as u16)
            .u16(self.maximum_request_length)
            .u8(self.roots.len() as u8)
            .u8(self.pixmap_formats.len() as u8)
            .u8(self.image_byte_order as u8)
            .u8(self.bitmap_format_bit_order as u8)
            .u8(self.bitmap_format_scanline_unit)
            .u8(self.bitmap_format_scanline_pad)
            .u8(self.min_keycode)
            .u8(self.max_keycode)
            .zeros(4)
            .padded_bytes(self.vendor.as_bytes());

        for format in &self.pixmap_formats {
            format.encode(&mut writer);
        }
        for screen in &self.roots {
            screen.encode(&mut writer);
        }

        // length in 4-byte units, excluding the first 8 bytes
        let length = ((writer.len() - 8) / 4) as u16;
        writer.put_u16_at(6, length);
        writer.into_inner()
    }
}

/// Setup failed response
#[derive(Debug, Clone)]
pub struct SetupFailed {
    pub protocol_major_version: u16,
    pub protocol_minor_version: u16,
    pub reason: String,
}

impl SetupFailed {
    pub fn encode(&self, byte_order: ByteOrder) -> Vec<u8> {
        let reason = &self.reason.as_bytes()[..self.reason.len().min(255)];
        let mut writer = WireWriter::new(byte_order);
        writer
            .u8(SetupStatus::Failed as u8)
            .u8(reason.len() as u8)
            .u16(self.protocol_major_version)
            .u16(self.protocol_minor_version)
            .u16((padded_len(reason.len()) / 4) as u16)
            .padded_bytes(reason);
        writer.into_inner()
    }
}
