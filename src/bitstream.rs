use std::collections::HashMap;

use tracing::trace;

use crate::contract::{ColorSpace, Dimensions};

pub(crate) const NAL_SLICE: u8 = 1;
pub(crate) const NAL_IDR: u8 = 5;
pub(crate) const NAL_SPS: u8 = 7;
pub(crate) const NAL_PPS: u8 = 8;

const MAX_QP: i32 = 51;
const MAX_REF_IDX: u32 = 32;

// Profiles whose SPS carries chroma format, bit depth and scaling matrices.
const HIGH_PROFILES: [u8; 13] = [100, 110, 122, 244, 44, 83, 86, 118, 128, 138, 139, 134, 135];

fn find_start_codes(data: &[u8]) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let mut i = 0usize;
    while i + 3 <= data.len() {
        if i + 4 <= data.len()
            && data[i] == 0
            && data[i + 1] == 0
            && data[i + 2] == 0
            && data[i + 3] == 1
        {
            out.push((i, 4));
            i += 4;
            continue;
        }
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            out.push((i, 3));
            i += 3;
            continue;
        }
        i += 1;
    }
    out
}

pub fn split_nal_units(data: &[u8]) -> Vec<&[u8]> {
    let codes = find_start_codes(data);
    codes
        .iter()
        .enumerate()
        .map(|(i, (pos, len))| {
            let end = codes.get(i + 1).map_or(data.len(), |(next, _)| *next);
            &data[pos + len..end]
        })
        .filter(|nal| !nal.is_empty())
        .collect()
}

pub(crate) fn nal_unit_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|header| header & 0x1f)
}

pub(crate) fn unescape_rbsp(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0;
    for &b in data {
        if zeros >= 2 && b == 3 {
            zeros = 0;
            continue;
        }
        zeros = if b == 0 { zeros + 1 } else { 0 };
        out.push(b);
    }
    out
}

pub(crate) fn escape_rbsp(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 64);
    let mut zeros = 0;
    for &b in data {
        if zeros >= 2 && b <= 3 {
            out.push(3);
            zeros = 0;
        }
        zeros = if b == 0 { zeros + 1 } else { 0 };
        out.push(b);
    }
    out
}

struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn flag(&mut self) -> Option<bool> {
        let byte = *self.data.get(self.pos / 8)?;
        let bit = (byte >> (7 - self.pos % 8)) & 1;
        self.pos += 1;
        Some(bit == 1)
    }

    fn bits(&mut self, n: u32) -> Option<u32> {
        let mut v = 0u32;
        for _ in 0..n {
            v = (v << 1) | u32::from(self.flag()?);
        }
        Some(v)
    }

    fn ue(&mut self) -> Option<u32> {
        let mut zeros = 0u32;
        while !self.flag()? {
            zeros += 1;
            if zeros > 31 {
                return None;
            }
        }
        let rest = u64::from(self.bits(zeros)?);
        u32::try_from((1u64 << zeros) - 1 + rest).ok()
    }

    fn se(&mut self) -> Option<i32> {
        let k = i64::from(self.ue()?);
        let v = if k % 2 == 1 { (k + 1) / 2 } else { -(k / 2) };
        i32::try_from(v).ok()
    }
}

#[derive(Debug, Default)]
pub(crate) struct BitWriter {
    bytes: Vec<u8>,
    used: u8,
}

impl BitWriter {
    pub(crate) fn flag(&mut self, bit: bool) -> &mut Self {
        if self.used == 0 {
            self.bytes.push(0);
        }
        if bit {
            if let Some(last) = self.bytes.last_mut() {
                *last |= 1 << (7 - self.used);
            }
        }
        self.used = (self.used + 1) % 8;
        self
    }

    pub(crate) fn bits(&mut self, value: u64, n: u32) -> &mut Self {
        for i in (0..n).rev() {
            self.flag((value >> i) & 1 == 1);
        }
        self
    }

    pub(crate) fn ue(&mut self, value: u32) -> &mut Self {
        let x = u64::from(value) + 1;
        let len = 64 - x.leading_zeros();
        self.bits(0, len - 1).bits(x, len)
    }

    pub(crate) fn se(&mut self, value: i32) -> &mut Self {
        let v = i64::from(value);
        let k = if v > 0 { 2 * v - 1 } else { -2 * v };
        self.ue(k as u32)
    }

    pub(crate) fn finish_rbsp(&mut self) -> Vec<u8> {
        self.flag(true);
        while self.used != 0 {
            self.flag(false);
        }
        std::mem::take(&mut self.bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpsInfo {
    pub id: u32,
    pub profile_idc: u8,
    pub chroma_format_idc: u32,
    pub separate_colour_plane: bool,
    pub bit_depth_luma: u32,
    pub log2_max_frame_num: u32,
    pub pic_order_cnt_type: u32,
    pub log2_max_pic_order_cnt_lsb: u32,
    pub delta_pic_order_always_zero: bool,
    pub frame_mbs_only: bool,
    pub coded_width: u32,
    pub coded_height: u32,
    pub crop_left: u32,
    pub crop_right: u32,
    pub crop_top: u32,
    pub crop_bottom: u32,
    pub color_space: Option<ColorSpace>,
}

impl SpsInfo {
    fn chroma_array_type(&self) -> u32 {
        if self.separate_colour_plane {
            0
        } else {
            self.chroma_format_idc
        }
    }

    pub fn coded_dims(&self) -> Option<Dimensions> {
        Dimensions::new(self.coded_width, self.coded_height)
    }

    pub fn display_dims(&self) -> Option<Dimensions> {
        Dimensions::new(
            self.coded_width
                .checked_sub(self.crop_left.checked_add(self.crop_right)?)?,
            self.coded_height
                .checked_sub(self.crop_top.checked_add(self.crop_bottom)?)?,
        )
    }
}

fn skip_scaling_list(r: &mut BitReader<'_>, size: usize) -> Option<()> {
    let mut last = 8i32;
    let mut next = 8i32;
    for _ in 0..size {
        if next != 0 {
            let delta = r.se()?;
            if !(-128..=127).contains(&delta) {
                return None;
            }
            next = (last + delta + 256).rem_euclid(256);
        }
        if next != 0 {
            last = next;
        }
    }
    Some(())
}

fn parse_vui_color(r: &mut BitReader<'_>) -> Option<Option<ColorSpace>> {
    if r.flag()? {
        let aspect_ratio_idc = r.bits(8)?;
        if aspect_ratio_idc == 255 {
            r.bits(32)?;
        }
    }
    if r.flag()? {
        r.flag()?;
    }
    if !r.flag()? {
        return Some(None);
    }
    let _video_format = r.bits(3)?;
    let full_range = r.flag()?;
    let mut color = ColorSpace {
        full_range: Some(full_range),
        ..ColorSpace::default()
    };
    if r.flag()? {
        // Code point 2 means unspecified.
        let described = |v: u32| u8::try_from(v).ok().filter(|v| *v != 2);
        color.primaries = described(r.bits(8)?);
        color.transfer = described(r.bits(8)?);
        color.matrix = described(r.bits(8)?);
    }
    Some(Some(color))
}

fn parse_sps(rbsp: &[u8]) -> Option<SpsInfo> {
    let mut r = BitReader::new(rbsp);
    let profile_idc = r.bits(8)? as u8;
    r.bits(16)?;
    let id = r.ue()?;
    if id > 31 {
        return None;
    }

    let mut chroma_format_idc = 1;
    let mut separate_colour_plane = false;
    let mut bit_depth_luma = 8;
    if HIGH_PROFILES.contains(&profile_idc) {
        chroma_format_idc = r.ue()?;
        if chroma_format_idc > 3 {
            return None;
        }
        if chroma_format_idc == 3 {
            separate_colour_plane = r.flag()?;
        }
        let luma_extra = r.ue()?;
        if luma_extra > 6 {
            return None;
        }
        bit_depth_luma = luma_extra + 8;
        let _bit_depth_chroma_minus8 = r.ue()?;
        r.flag()?;
        if r.flag()? {
            let lists = if chroma_format_idc == 3 { 12 } else { 8 };
            for i in 0..lists {
                if r.flag()? {
                    skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    let log2_max_frame_num = r.ue()?.checked_add(4)?;
    let pic_order_cnt_type = r.ue()?;
    let mut log2_max_pic_order_cnt_lsb = 0;
    let mut delta_pic_order_always_zero = false;
    match pic_order_cnt_type {
        0 => log2_max_pic_order_cnt_lsb = r.ue()?.checked_add(4)?,
        1 => {
            delta_pic_order_always_zero = r.flag()?;
            r.se()?;
            r.se()?;
            let cycle = r.ue()?;
            if cycle > 255 {
                return None;
            }
            for _ in 0..cycle {
                r.se()?;
            }
        }
        2 => {}
        _ => return None,
    }
    if log2_max_frame_num > 16 || log2_max_pic_order_cnt_lsb > 16 {
        return None;
    }

    let _max_num_ref_frames = r.ue()?;
    r.flag()?;
    let width_mbs = r.ue()?.checked_add(1)?;
    let height_map_units = r.ue()?.checked_add(1)?;
    let frame_mbs_only = r.flag()?;
    if !frame_mbs_only {
        r.flag()?;
    }
    r.flag()?;

    let mut crop = [0u32; 4];
    if r.flag()? {
        for value in &mut crop {
            *value = r.ue()?;
        }
    }
    let color_space = if r.flag()? {
        parse_vui_color(&mut r).unwrap_or_default()
    } else {
        None
    };

    let field_factor = if frame_mbs_only { 1 } else { 2 };
    let mut sps = SpsInfo {
        id,
        profile_idc,
        chroma_format_idc,
        separate_colour_plane,
        bit_depth_luma,
        log2_max_frame_num,
        pic_order_cnt_type,
        log2_max_pic_order_cnt_lsb,
        delta_pic_order_always_zero,
        frame_mbs_only,
        coded_width: width_mbs.checked_mul(16)?,
        coded_height: height_map_units.checked_mul(16 * field_factor)?,
        crop_left: 0,
        crop_right: 0,
        crop_top: 0,
        crop_bottom: 0,
        color_space,
    };
    let (unit_x, unit_y) = match sps.chroma_array_type() {
        0 => (1, field_factor),
        1 => (2, 2 * field_factor),
        2 => (2, field_factor),
        _ => (1, field_factor),
    };
    let [left, right, top, bottom] = crop;
    sps.crop_left = left.checked_mul(unit_x)?;
    sps.crop_right = right.checked_mul(unit_x)?;
    sps.crop_top = top.checked_mul(unit_y)?;
    sps.crop_bottom = bottom.checked_mul(unit_y)?;
    Some(sps)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PpsInfo {
    id: u32,
    sps_id: u32,
    entropy_coding_mode: bool,
    bottom_field_pic_order_in_frame_present: bool,
    num_ref_idx_l0_default: u32,
    num_ref_idx_l1_default: u32,
    weighted_pred: bool,
    weighted_bipred_idc: u32,
    pic_init_qp_minus26: i32,
    redundant_pic_cnt_present: bool,
}

fn parse_pps(rbsp: &[u8]) -> Option<PpsInfo> {
    let mut r = BitReader::new(rbsp);
    let id = r.ue()?;
    let sps_id = r.ue()?;
    if id > 255 || sps_id > 31 {
        return None;
    }
    let entropy_coding_mode = r.flag()?;
    let bottom_field_pic_order_in_frame_present = r.flag()?;
    let num_slice_groups_minus1 = r.ue()?;
    if num_slice_groups_minus1 > 7 {
        return None;
    }
    if num_slice_groups_minus1 > 0 {
        match r.ue()? {
            0 => {
                for _ in 0..=num_slice_groups_minus1 {
                    r.ue()?;
                }
            }
            2 => {
                for _ in 0..num_slice_groups_minus1 {
                    r.ue()?;
                    r.ue()?;
                }
            }
            3..=5 => {
                r.flag()?;
                r.ue()?;
            }
            6 => {
                let map_units = r.ue()?.checked_add(1)?;
                let id_bits = 32 - num_slice_groups_minus1.leading_zeros();
                for _ in 0..map_units {
                    r.bits(id_bits)?;
                }
            }
            _ => {}
        }
    }
    let num_ref_idx_l0_default = r.ue()?.checked_add(1)?;
    let num_ref_idx_l1_default = r.ue()?.checked_add(1)?;
    let weighted_pred = r.flag()?;
    let weighted_bipred_idc = r.bits(2)?;
    let pic_init_qp_minus26 = r.se()?;
    if !(-26..=25).contains(&pic_init_qp_minus26) {
        return None;
    }
    r.se()?;
    r.se()?;
    r.flag()?;
    r.flag()?;
    let redundant_pic_cnt_present = r.flag()?;
    Some(PpsInfo {
        id,
        sps_id,
        entropy_coding_mode,
        bottom_field_pic_order_in_frame_present,
        num_ref_idx_l0_default,
        num_ref_idx_l1_default,
        weighted_pred,
        weighted_bipred_idc,
        pic_init_qp_minus26,
        redundant_pic_cnt_present,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SliceKind {
    P,
    B,
    I,
    Sp,
    Si,
}

impl SliceKind {
    fn from_type(slice_type: u32) -> Option<Self> {
        match slice_type % 5 {
            0 => Some(Self::P),
            1 => Some(Self::B),
            2 => Some(Self::I),
            3 => Some(Self::Sp),
            4 => Some(Self::Si),
            _ => None,
        }
    }

    fn is_intra(self) -> bool {
        matches!(self, Self::I | Self::Si)
    }
}

fn skip_ref_pic_list_modification(r: &mut BitReader<'_>) -> Option<()> {
    if r.flag()? {
        loop {
            match r.ue()? {
                0..=2 => {
                    r.ue()?;
                }
                3 => break,
                _ => return None,
            }
        }
    }
    Some(())
}

fn skip_weights(r: &mut BitReader<'_>, count: u32, chroma: bool) -> Option<()> {
    for _ in 0..count {
        if r.flag()? {
            r.se()?;
            r.se()?;
        }
        if chroma && r.flag()? {
            for _ in 0..4 {
                r.se()?;
            }
        }
    }
    Some(())
}

#[derive(Debug, Default)]
pub struct H264BitstreamParser {
    sps: HashMap<u32, SpsInfo>,
    pps: HashMap<u32, PpsInfo>,
    last_sps_id: Option<u32>,
    last_slice_pps: Option<u32>,
    last_slice_qp: Option<i32>,
}

impl H264BitstreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse_packet(&mut self, data: &[u8]) {
        for nal in split_nal_units(data) {
            self.parse_nal(nal);
        }
    }

    fn parse_nal(&mut self, nal: &[u8]) {
        let (Some(nal_type), Some((&header, payload))) = (nal_unit_type(nal), nal.split_first())
        else {
            return;
        };
        let nal_ref_idc = (header >> 5) & 0x3;
        match nal_type {
            NAL_SPS => match parse_sps(&unescape_rbsp(payload)) {
                Some(sps) => {
                    self.last_sps_id = Some(sps.id);
                    self.sps.insert(sps.id, sps);
                }
                None => trace!("ignoring unparseable sps"),
            },
            NAL_PPS => match parse_pps(&unescape_rbsp(payload)) {
                Some(pps) => {
                    self.pps.insert(pps.id, pps);
                }
                None => trace!("ignoring unparseable pps"),
            },
            NAL_SLICE | NAL_IDR => {
                self.last_slice_qp = self.parse_slice_qp(&unescape_rbsp(payload), nal_type, nal_ref_idc);
                if self.last_slice_qp.is_none() {
                    trace!(nal_type, "slice header did not yield a qp");
                }
            }
            _ => {}
        }
    }

    fn parse_slice_qp(&mut self, rbsp: &[u8], nal_type: u8, nal_ref_idc: u8) -> Option<i32> {
        let mut r = BitReader::new(rbsp);
        r.ue()?;
        let kind = SliceKind::from_type(r.ue()?)?;
        let pps_id = r.ue()?;
        let pps = self.pps.get(&pps_id)?;
        let sps = self.sps.get(&pps.sps_id)?;
        self.last_slice_pps = Some(pps_id);
        let idr = nal_type == NAL_IDR;

        if sps.separate_colour_plane {
            r.bits(2)?;
        }
        r.bits(sps.log2_max_frame_num)?;
        let mut field_pic = false;
        if !sps.frame_mbs_only {
            field_pic = r.flag()?;
            if field_pic {
                r.flag()?;
            }
        }
        if idr {
            r.ue()?;
        }
        if sps.pic_order_cnt_type == 0 {
            r.bits(sps.log2_max_pic_order_cnt_lsb)?;
            if pps.bottom_field_pic_order_in_frame_present && !field_pic {
                r.se()?;
            }
        }
        if sps.pic_order_cnt_type == 1 && !sps.delta_pic_order_always_zero {
            r.se()?;
            if pps.bottom_field_pic_order_in_frame_present && !field_pic {
                r.se()?;
            }
        }
        if pps.redundant_pic_cnt_present {
            r.ue()?;
        }
        if kind == SliceKind::B {
            r.flag()?;
        }

        let mut l0 = pps.num_ref_idx_l0_default;
        let mut l1 = pps.num_ref_idx_l1_default;
        if matches!(kind, SliceKind::P | SliceKind::Sp | SliceKind::B) && r.flag()? {
            l0 = r.ue()?.checked_add(1)?;
            if kind == SliceKind::B {
                l1 = r.ue()?.checked_add(1)?;
            }
        }
        if l0 > MAX_REF_IDX || l1 > MAX_REF_IDX {
            return None;
        }

        if !kind.is_intra() {
            skip_ref_pic_list_modification(&mut r)?;
            if kind == SliceKind::B {
                skip_ref_pic_list_modification(&mut r)?;
            }
        }

        let weighted = (pps.weighted_pred && matches!(kind, SliceKind::P | SliceKind::Sp))
            || (pps.weighted_bipred_idc == 1 && kind == SliceKind::B);
        if weighted {
            let chroma = sps.chroma_array_type() != 0;
            r.ue()?;
            if chroma {
                r.ue()?;
            }
            skip_weights(&mut r, l0, chroma)?;
            if kind == SliceKind::B {
                skip_weights(&mut r, l1, chroma)?;
            }
        }

        if nal_ref_idc != 0 {
            if idr {
                r.flag()?;
                r.flag()?;
            } else if r.flag()? {
                loop {
                    let op = r.ue()?;
                    match op {
                        0 => break,
                        1..=6 => {
                            if matches!(op, 1 | 3) {
                                r.ue()?;
                            }
                            if op == 2 {
                                r.ue()?;
                            }
                            if matches!(op, 3 | 6) {
                                r.ue()?;
                            }
                            if op == 4 {
                                r.ue()?;
                            }
                        }
                        _ => return None,
                    }
                }
            }
        }

        if pps.entropy_coding_mode && !kind.is_intra() {
            r.ue()?;
        }
        let slice_qp_delta = r.se()?;
        26i32
            .checked_add(pps.pic_init_qp_minus26)?
            .checked_add(slice_qp_delta)
    }

    /// QP of the last parsed slice, or `None` if it could not be determined or is out of range.
    pub fn last_slice_qp(&self) -> Option<u8> {
        let qp = self.last_slice_qp?;
        if !(0..=MAX_QP).contains(&qp) {
            return None;
        }
        u8::try_from(qp).ok()
    }

    pub fn active_sps(&self) -> Option<&SpsInfo> {
        self.last_slice_pps
            .and_then(|pps_id| self.pps.get(&pps_id))
            .and_then(|pps| self.sps.get(&pps.sps_id))
            .or_else(|| self.last_sps_id.and_then(|id| self.sps.get(&id)))
    }
}
