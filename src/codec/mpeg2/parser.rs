// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! An MPEG-2 video (ISO/IEC 13818-2) header parser.
//!
//! The client splits the elementary stream into units delimited by start
//! codes and submits each unit separately; this module decodes the metadata
//! units ahead of the picture data (sequence header and extension, GOP
//! header, picture header and coding extension, quantization matrix
//! extension, slice header) into plain records a downstream decoder consumes.

use enumn::N;
use log::debug;
use thiserror::Error;

use crate::bitstream_utils::BitReader;
use crate::bitstream_utils::ReadBitsError;

/// Size of the `0x00 0x00 0x01` sequence preceding the unit type byte.
pub const START_CODE_PREFIX_SIZE: usize = 3;

/// Size of a full start code, including the unit type byte. All the
/// minimum-length arithmetic below counts from this.
pub const START_CODE_SIZE: usize = 4;

/// Default matrix for intra blocks, ISO/IEC 13818-2 section 6.3.7.
pub const DEFAULT_INTRA_QUANTISER_MATRIX: [u8; 64] = [
    8, 16, 16, 19, 16, 19, 22, 22, 22, 22, 22, 22, 26, 24, 26, 27, 27, 27, 26, 26, 26, 26, 27, 27,
    27, 29, 29, 29, 34, 34, 34, 29, 29, 29, 27, 27, 29, 29, 32, 32, 34, 34, 37, 38, 37, 35, 35, 34,
    35, 38, 38, 40, 40, 40, 48, 48, 46, 46, 56, 56, 58, 69, 69, 83,
];

/// Default matrix for non-intra blocks, ISO/IEC 13818-2 section 6.3.7.
pub const DEFAULT_NON_INTRA_QUANTISER_MATRIX: [u8; 64] = [16; 64];

/// Sentinel increment value marking the escape entry of the VLC table.
const MB_ESCAPE_INCREMENT: u8 = 0xff;

/// Macroblock address-increment codes, ISO/IEC 13818-2 section B.1 table B-1,
/// as (number of bits, code, increment value).
///
/// The entries are matched in table order: several entries share a bit length
/// with different code patterns, and the first structural match wins. The
/// last entry is the escape code, meaning "add 33 and decode another code".
const MB_ADDRESS_INCREMENT_VLC: [(u8, u32, u8); 34] = [
    (1, 0x1, 1),
    (3, 0x3, 2),
    (3, 0x2, 3),
    (4, 0x3, 4),
    (4, 0x2, 5),
    (5, 0x3, 6),
    (5, 0x2, 7),
    (7, 0x7, 8),
    (7, 0x6, 9),
    (8, 0xb, 10),
    (8, 0xa, 11),
    (8, 0x9, 12),
    (8, 0x8, 13),
    (8, 0x7, 14),
    (8, 0x6, 15),
    (10, 0x17, 16),
    (10, 0x16, 17),
    (10, 0x15, 18),
    (10, 0x14, 19),
    (10, 0x13, 20),
    (10, 0x12, 21),
    (11, 0x23, 22),
    (11, 0x22, 23),
    (11, 0x21, 24),
    (11, 0x20, 25),
    (11, 0x1f, 26),
    (11, 0x1e, 27),
    (11, 0x1d, 28),
    (11, 0x1c, 29),
    (11, 0x1b, 30),
    (11, 0x1a, 31),
    (11, 0x19, 32),
    (11, 0x18, 33),
    (11, 0x8, MB_ESCAPE_INCREMENT),
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unit is shorter than the structural minimum for this header kind")]
    IncompleteHeader,
    #[error("extension identifier {0} does not match the expected one")]
    WrongExtensionType(u8),
    #[error("a bit mandated to be 1 was 0")]
    MissingMarkerBit,
    #[error("a bit mandated to be 0 was 1")]
    ReservedBitViolation,
    #[error("an extra/terminator bit in the slice header violated its mandated value")]
    CorruptExtraBits,
    #[error("no macroblock address-increment code matched the input")]
    MacroblockDecodeFailure,
    #[error("bit read past the end of the unit")]
    OutOfBounds(#[from] ReadBitsError),
}

/// The kind of a unit, classified from the byte following the start-code
/// prefix. ISO/IEC 13818-2 table 6-1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitType {
    Picture,
    /// A slice; the code doubles as the slice's raw vertical position.
    Slice(u8),
    UserData,
    SequenceHeader,
    SequenceError,
    Extension,
    SequenceEnd,
    Group,
    /// A system start code (0xb9..=0xff), not part of the video layer.
    System(u8),
    Reserved(u8),
}

impl UnitType {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => UnitType::Picture,
            0x01..=0xaf => UnitType::Slice(code),
            0xb2 => UnitType::UserData,
            0xb3 => UnitType::SequenceHeader,
            0xb4 => UnitType::SequenceError,
            0xb5 => UnitType::Extension,
            0xb7 => UnitType::SequenceEnd,
            0xb8 => UnitType::Group,
            0xb9..=0xff => UnitType::System(code),
            _ => UnitType::Reserved(code),
        }
    }
}

/// Classify a unit from the type byte following the start-code prefix.
///
/// Pure; does not touch the parser context.
pub fn classify_unit(unit: &[u8]) -> Result<UnitType, ParseError> {
    let code = unit.get(START_CODE_PREFIX_SIZE).ok_or(ParseError::IncompleteHeader)?;
    Ok(UnitType::from_code(*code))
}

/// Extension identifiers, ISO/IEC 13818-2 table 6-2.
#[derive(N, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionIdentifier {
    Sequence = 1,
    SequenceDisplay = 2,
    QuantizationMatrix = 3,
    Copyright = 4,
    SequenceScalable = 5,
    PictureDisplay = 7,
    PictureCoding = 8,
    PictureSpatialScalable = 9,
    PictureTemporalScalable = 10,
}

#[derive(N, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PictureCodingType {
    I = 1,
    P = 2,
    B = 3,
    D = 4,
}

/// The four quantiser matrices and their load flags. Embedded both in the
/// sequence header (where only the intra/non-intra pair is coded) and in the
/// quant matrix extension (where all four are).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QuantMatrices {
    pub load_intra_quantiser_matrix: bool,
    pub intra_quantiser_matrix: [u8; 64],
    pub load_non_intra_quantiser_matrix: bool,
    pub non_intra_quantiser_matrix: [u8; 64],
    pub load_chroma_intra_quantiser_matrix: bool,
    pub chroma_intra_quantiser_matrix: [u8; 64],
    pub load_chroma_non_intra_quantiser_matrix: bool,
    pub chroma_non_intra_quantiser_matrix: [u8; 64],
}

impl Default for QuantMatrices {
    fn default() -> Self {
        Self {
            load_intra_quantiser_matrix: false,
            intra_quantiser_matrix: [0; 64],
            load_non_intra_quantiser_matrix: false,
            non_intra_quantiser_matrix: [0; 64],
            load_chroma_intra_quantiser_matrix: false,
            chroma_intra_quantiser_matrix: [0; 64],
            load_chroma_non_intra_quantiser_matrix: false,
            chroma_non_intra_quantiser_matrix: [0; 64],
        }
    }
}

/// Parsed `sequence_header()`, ISO/IEC 13818-2 section 6.2.2.1.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SeqHeader {
    /// The 12 least significant bits of the picture width.
    pub horizontal_size_value: u16,
    /// The 12 least significant bits of the picture height.
    pub vertical_size_value: u16,
    pub aspect_ratio_info: u8,
    pub frame_rate_code: u8,
    /// The 18 least significant bits of the stream bit rate, in units of 400
    /// bits/second.
    pub bit_rate_value: u32,
    /// The 10 least significant bits of the VBV buffer size, in units of 16
    /// KiB.
    pub vbv_buffer_size_value: u16,
    pub constrained_params_flag: bool,
    /// Intra/non-intra matrices, always populated after a successful parse:
    /// either loaded from the stream or substituted with the standard
    /// defaults of section 6.3.7.
    pub quant_matrices: QuantMatrices,
}

/// Parsed `sequence_extension()`, ISO/IEC 13818-2 section 6.2.2.3.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SeqExtension {
    pub extension_start_code_identifier: u8,
    pub profile_and_level_indication: u8,
    pub progressive_sequence: bool,
    pub chroma_format: u8,
    /// The 2 most significant bits of the picture width, to combine with
    /// `horizontal_size_value`.
    pub horizontal_size_extension: u8,
    /// The 2 most significant bits of the picture height, to combine with
    /// `vertical_size_value`. Gates slice vertical addressing.
    pub vertical_size_extension: u8,
    pub bit_rate_extension: u16,
    pub vbv_buffer_size_extension: u8,
    pub low_delay: bool,
    pub frame_rate_extension_n: u8,
    pub frame_rate_extension_d: u8,
}

/// Parsed `group_of_pictures_header()`, ISO/IEC 13818-2 section 6.2.2.6.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GopHeader {
    pub drop_frame_flag: bool,
    pub time_code_hours: u8,
    pub time_code_minutes: u8,
    pub time_code_seconds: u8,
    pub time_code_pictures: u8,
    pub closed_gop: bool,
    pub broken_link: bool,
}

/// Parsed `picture_header()`, ISO/IEC 13818-2 section 6.2.3.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PictureHeader {
    pub temporal_reference: u16,
    /// Raw coding type. See [`PictureCodingType`] for the values assigned by
    /// the standard; other values are retained as read, not rejected.
    pub picture_coding_type: u8,
    pub vbv_delay: u16,
    /// Only meaningful for P and B pictures.
    pub full_pel_forward_vector: bool,
    /// Only meaningful for P and B pictures.
    pub forward_f_code: u8,
    /// Only meaningful for B pictures.
    pub full_pel_backward_vector: bool,
    /// Only meaningful for B pictures.
    pub backward_f_code: u8,
    /// Number of extra_information_picture bytes announced by set
    /// extra_bit_picture flags and skipped over.
    pub extra_picture_bytes: u32,
}

/// Parsed `picture_coding_extension()`, ISO/IEC 13818-2 section 6.2.3.1.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PictureCodingExtension {
    pub extension_start_code_identifier: u8,
    /// Motion vector range/precision exponents, indexed as
    /// `f_code[forward/backward][horizontal/vertical]`.
    pub f_code: [[u8; 2]; 2],
    pub intra_dc_precision: u8,
    pub picture_structure: u8,
    pub top_field_first: bool,
    pub frame_pred_frame_dct: bool,
    pub concealment_motion_vectors: bool,
    pub q_scale_type: bool,
    pub intra_vlc_format: bool,
    pub alternate_scan: bool,
    pub repeat_first_field: bool,
    pub chroma_420_type: bool,
    pub progressive_frame: bool,
    pub composite_display_flag: bool,
    /* if composite_display_flag == 1 */
    pub v_axis: bool,
    pub field_sequence: u8,
    pub sub_carrier: bool,
    pub burst_amplitude: u8,
    pub sub_carrier_phase: u8,
}

/// Parsed `quant_matrix_extension()`, ISO/IEC 13818-2 section 6.2.3.2.
///
/// Unlike the sequence header there is no standard default at this layer: a
/// matrix whose load flag is unset keeps the value previously held by the
/// parser context.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QuantMatrixExtension {
    pub extension_start_code_identifier: u8,
    pub quant_matrices: QuantMatrices,
}

/// Parsed `slice()` header, ISO/IEC 13818-2 section 6.2.4. Freshly produced
/// per call and never stored back into the parser context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Slice<'a> {
    /// The raw vertical position byte, i.e. the unit type byte itself.
    pub vertical_position: u8,
    /// Only present for pictures taller than 2800 lines.
    pub slice_vertical_position_extension: u8,
    pub macroblock_row: u32,
    /// Decoded from the first macroblock_address_increment of the slice.
    pub macroblock_column: u32,
    pub quantiser_scale_code: u8,
    pub intra_slice_flag: bool,
    pub intra_slice: bool,
    /// Size of the slice header in bits, counted from the unit type byte.
    /// The macroblock data the decoder consumes starts at this offset.
    pub header_size: u32,
    /// The unit this slice was parsed from. Not owned.
    pub data: &'a [u8],
}

impl<'a> AsRef<[u8]> for Slice<'a> {
    fn as_ref(&self) -> &[u8] {
        self.data
    }
}

/// A unit successfully decoded by [`Parser::parse_unit`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParsedUnit<'a> {
    SequenceHeader(SeqHeader),
    SequenceExtension(SeqExtension),
    GopHeader(GopHeader),
    PictureHeader(PictureHeader),
    PictureCodingExtension(PictureCodingExtension),
    QuantMatrixExtension(QuantMatrixExtension),
    Slice(Slice<'a>),
    /// A unit kind this layer does not decode (user data, unhandled
    /// extensions, sequence end, system codes).
    Ignored(UnitType),
}

/// An MPEG-2 header parser based on libyami's mpeg2 parser.
///
/// The parser holds the most recently parsed instance of each persistent
/// header type, because later units depend on earlier ones: slice addressing
/// reads the sequence size, and quantization matrices persist across
/// pictures. One `Parser` per stream; a default-constructed parser models a
/// cold start and parses slices against zero-valued sequence fields without
/// faulting.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Parser {
    sequence_header: SeqHeader,
    sequence_extension: SeqExtension,
    gop_header: GopHeader,
    picture_header: PictureHeader,
    picture_coding_extension: PictureCodingExtension,
    quant_matrix_extension: QuantMatrixExtension,
}

impl Parser {
    pub fn sequence_header(&self) -> &SeqHeader {
        &self.sequence_header
    }

    pub fn sequence_extension(&self) -> &SeqExtension {
        &self.sequence_extension
    }

    pub fn gop_header(&self) -> &GopHeader {
        &self.gop_header
    }

    pub fn picture_header(&self) -> &PictureHeader {
        &self.picture_header
    }

    pub fn picture_coding_extension(&self) -> &PictureCodingExtension {
        &self.picture_coding_extension
    }

    pub fn quant_matrix_extension(&self) -> &QuantMatrixExtension {
        &self.quant_matrix_extension
    }

    /// Reads a load flag and, if set, the 64 bytes of `matrix`. An unset flag
    /// leaves `matrix` untouched.
    fn read_quant_matrix(
        reader: &mut BitReader,
        load_flag: &mut bool,
        matrix: &mut [u8; 64],
    ) -> Result<(), ParseError> {
        *load_flag = reader.read_bit()?;

        if *load_flag {
            for value in matrix.iter_mut() {
                *value = reader.read_bits::<u8>(8)?;
            }
        }

        Ok(())
    }

    /// Like [`Parser::read_quant_matrix`], but an unset flag substitutes
    /// `default` and marks the matrix loaded, per section 6.3.7.
    fn read_quant_matrix_or_default(
        reader: &mut BitReader,
        load_flag: &mut bool,
        matrix: &mut [u8; 64],
        default: &[u8; 64],
    ) -> Result<(), ParseError> {
        Self::read_quant_matrix(reader, load_flag, matrix)?;

        if !*load_flag {
            *matrix = *default;
            *load_flag = true;
        }

        Ok(())
    }

    /// Parse a `sequence_header()` unit and replace the context's sequence
    /// header with it.
    pub fn parse_sequence_header(&mut self, unit: &[u8]) -> Result<SeqHeader, ParseError> {
        if unit.len() < START_CODE_SIZE + 7 {
            return Err(ParseError::IncompleteHeader);
        }

        debug!("parsing sequence header");

        let mut reader = BitReader::new(&unit[START_CODE_PREFIX_SIZE..]);
        reader.skip_byte()?;

        let mut hdr = SeqHeader::default();
        hdr.horizontal_size_value = reader.read_bits(12)?;
        hdr.vertical_size_value = reader.read_bits(12)?;
        hdr.aspect_ratio_info = reader.read_bits(4)?;
        hdr.frame_rate_code = reader.read_bits(4)?;
        hdr.bit_rate_value = reader.read_bits(18)?;

        if !reader.read_marker(true)? {
            return Err(ParseError::MissingMarkerBit);
        }

        hdr.vbv_buffer_size_value = reader.read_bits(10)?;
        hdr.constrained_params_flag = reader.read_bit()?;

        Self::read_quant_matrix_or_default(
            &mut reader,
            &mut hdr.quant_matrices.load_intra_quantiser_matrix,
            &mut hdr.quant_matrices.intra_quantiser_matrix,
            &DEFAULT_INTRA_QUANTISER_MATRIX,
        )?;
        Self::read_quant_matrix_or_default(
            &mut reader,
            &mut hdr.quant_matrices.load_non_intra_quantiser_matrix,
            &mut hdr.quant_matrices.non_intra_quantiser_matrix,
            &DEFAULT_NON_INTRA_QUANTISER_MATRIX,
        )?;

        self.sequence_header = hdr;
        Ok(hdr)
    }

    /// Parse a `sequence_extension()` unit and replace the context's sequence
    /// extension with it.
    pub fn parse_sequence_extension(&mut self, unit: &[u8]) -> Result<SeqExtension, ParseError> {
        if unit.len() < START_CODE_SIZE + 5 {
            return Err(ParseError::IncompleteHeader);
        }

        let mut reader = BitReader::new(&unit[START_CODE_PREFIX_SIZE..]);
        reader.skip_byte()?;

        let mut ext = SeqExtension::default();
        ext.extension_start_code_identifier = reader.read_bits(4)?;

        if ExtensionIdentifier::n(ext.extension_start_code_identifier)
            != Some(ExtensionIdentifier::Sequence)
        {
            return Err(ParseError::WrongExtensionType(ext.extension_start_code_identifier));
        }

        ext.profile_and_level_indication = reader.read_bits(8)?;
        ext.progressive_sequence = reader.read_bit()?;
        ext.chroma_format = reader.read_bits(2)?;
        ext.horizontal_size_extension = reader.read_bits(2)?;
        ext.vertical_size_extension = reader.read_bits(2)?;
        ext.bit_rate_extension = reader.read_bits(12)?;

        if !reader.read_marker(true)? {
            return Err(ParseError::MissingMarkerBit);
        }

        ext.vbv_buffer_size_extension = reader.read_bits(8)?;
        ext.low_delay = reader.read_bit()?;
        ext.frame_rate_extension_n = reader.read_bits(2)?;
        ext.frame_rate_extension_d = reader.read_bits(5)?;

        self.sequence_extension = ext;
        Ok(ext)
    }

    /// Parse a `group_of_pictures_header()` unit and replace the context's
    /// GOP header with it.
    pub fn parse_gop_header(&mut self, unit: &[u8]) -> Result<GopHeader, ParseError> {
        if unit.len() < START_CODE_SIZE + 3 {
            return Err(ParseError::IncompleteHeader);
        }

        let mut reader = BitReader::new(&unit[START_CODE_PREFIX_SIZE..]);
        reader.skip_byte()?;

        let mut hdr = GopHeader::default();
        hdr.drop_frame_flag = reader.read_bit()?;
        hdr.time_code_hours = reader.read_bits(5)?;
        hdr.time_code_minutes = reader.read_bits(6)?;

        if !reader.read_marker(true)? {
            return Err(ParseError::MissingMarkerBit);
        }

        hdr.time_code_seconds = reader.read_bits(6)?;
        hdr.time_code_pictures = reader.read_bits(6)?;
        hdr.closed_gop = reader.read_bit()?;
        hdr.broken_link = reader.read_bit()?;

        for _ in 0..5 {
            if !reader.read_marker(false)? {
                return Err(ParseError::ReservedBitViolation);
            }
        }

        self.gop_header = hdr;
        Ok(hdr)
    }

    /// Parse a `picture_header()` unit and replace the context's picture
    /// header with it.
    pub fn parse_picture_header(&mut self, unit: &[u8]) -> Result<PictureHeader, ParseError> {
        if unit.len() < START_CODE_SIZE + 3 {
            return Err(ParseError::IncompleteHeader);
        }

        debug!("parsing picture header");

        let mut reader = BitReader::new(&unit[START_CODE_PREFIX_SIZE..]);
        reader.skip_byte()?;

        let mut hdr = PictureHeader::default();
        hdr.temporal_reference = reader.read_bits(10)?;
        hdr.picture_coding_type = reader.read_bits(3)?;
        hdr.vbv_delay = reader.read_bits(16)?;

        let coding_type = PictureCodingType::n(hdr.picture_coding_type);

        if matches!(coding_type, Some(PictureCodingType::P | PictureCodingType::B)) {
            hdr.full_pel_forward_vector = reader.read_bit()?;
            hdr.forward_f_code = reader.read_bits(3)?;
        }

        if matches!(coding_type, Some(PictureCodingType::B)) {
            hdr.full_pel_backward_vector = reader.read_bit()?;
            hdr.backward_f_code = reader.read_bits(3)?;
        }

        // Each set extra_bit_picture flag announces one more byte of
        // extra_information_picture to skip; a clear flag ends the run.
        while reader.read_bit()? {
            reader.skip_byte()?;
            hdr.extra_picture_bytes += 1;
        }

        self.picture_header = hdr;
        Ok(hdr)
    }

    /// Parse a `picture_coding_extension()` unit and replace the context's
    /// picture coding extension with it.
    pub fn parse_picture_coding_extension(
        &mut self,
        unit: &[u8],
    ) -> Result<PictureCodingExtension, ParseError> {
        if unit.len() < START_CODE_SIZE + 4 {
            return Err(ParseError::IncompleteHeader);
        }

        let mut reader = BitReader::new(&unit[START_CODE_PREFIX_SIZE..]);
        reader.skip_byte()?;

        let mut ext = PictureCodingExtension::default();
        ext.extension_start_code_identifier = reader.read_bits(4)?;

        if ExtensionIdentifier::n(ext.extension_start_code_identifier)
            != Some(ExtensionIdentifier::PictureCoding)
        {
            return Err(ParseError::WrongExtensionType(ext.extension_start_code_identifier));
        }

        ext.f_code[0][0] = reader.read_bits(4)?;
        ext.f_code[0][1] = reader.read_bits(4)?;
        ext.f_code[1][0] = reader.read_bits(4)?;
        ext.f_code[1][1] = reader.read_bits(4)?;
        ext.intra_dc_precision = reader.read_bits(2)?;
        ext.picture_structure = reader.read_bits(2)?;
        ext.top_field_first = reader.read_bit()?;
        ext.frame_pred_frame_dct = reader.read_bit()?;
        ext.concealment_motion_vectors = reader.read_bit()?;
        ext.q_scale_type = reader.read_bit()?;
        ext.intra_vlc_format = reader.read_bit()?;
        ext.alternate_scan = reader.read_bit()?;
        ext.repeat_first_field = reader.read_bit()?;
        ext.chroma_420_type = reader.read_bit()?;
        ext.progressive_frame = reader.read_bit()?;
        ext.composite_display_flag = reader.read_bit()?;

        if ext.composite_display_flag {
            ext.v_axis = reader.read_bit()?;
            ext.field_sequence = reader.read_bits(3)?;
            ext.sub_carrier = reader.read_bit()?;
            ext.burst_amplitude = reader.read_bits(7)?;
            ext.sub_carrier_phase = reader.read_bits(8)?;
        }

        self.picture_coding_extension = ext;
        Ok(ext)
    }

    /// Parse a `quant_matrix_extension()` unit and replace the context's
    /// quant matrix extension with it. Matrices whose load flag is unset keep
    /// the value previously held by the context.
    pub fn parse_quant_matrix_extension(
        &mut self,
        unit: &[u8],
    ) -> Result<QuantMatrixExtension, ParseError> {
        if unit.len() < START_CODE_SIZE + 3 {
            return Err(ParseError::IncompleteHeader);
        }

        let mut reader = BitReader::new(&unit[START_CODE_PREFIX_SIZE..]);
        reader.skip_byte()?;

        // Start from the previous extension so that unset load flags retain
        // the matrices already held.
        let mut ext = self.quant_matrix_extension;
        ext.extension_start_code_identifier = reader.read_bits(4)?;

        if ExtensionIdentifier::n(ext.extension_start_code_identifier)
            != Some(ExtensionIdentifier::QuantizationMatrix)
        {
            return Err(ParseError::WrongExtensionType(ext.extension_start_code_identifier));
        }

        let matrices = &mut ext.quant_matrices;
        Self::read_quant_matrix(
            &mut reader,
            &mut matrices.load_intra_quantiser_matrix,
            &mut matrices.intra_quantiser_matrix,
        )?;
        Self::read_quant_matrix(
            &mut reader,
            &mut matrices.load_non_intra_quantiser_matrix,
            &mut matrices.non_intra_quantiser_matrix,
        )?;
        Self::read_quant_matrix(
            &mut reader,
            &mut matrices.load_chroma_intra_quantiser_matrix,
            &mut matrices.chroma_intra_quantiser_matrix,
        )?;
        Self::read_quant_matrix(
            &mut reader,
            &mut matrices.load_chroma_non_intra_quantiser_matrix,
            &mut matrices.chroma_non_intra_quantiser_matrix,
        )?;

        self.quant_matrix_extension = ext;
        Ok(ext)
    }

    /// Decode macroblock_address_increment codes until a terminal one, per
    /// section B.1 table B-1, and return the resulting macroblock column.
    fn read_macroblock_address_increment(reader: &mut BitReader) -> Result<u32, ParseError> {
        let mut total_increment = 0u32;

        loop {
            let mut matched = None;
            for (num_bits, code, increment) in MB_ADDRESS_INCREMENT_VLC {
                if reader.peek_bits::<u32>(num_bits as usize)? == code {
                    matched = Some((num_bits, increment));
                    break;
                }
            }

            let (num_bits, increment) =
                matched.ok_or(ParseError::MacroblockDecodeFailure)?;
            reader.skip_bits(num_bits as usize)?;

            if increment == MB_ESCAPE_INCREMENT {
                total_increment += 33;
            } else {
                return Ok(total_increment + u32::from(increment) - 1);
            }
        }
    }

    /// Parse the header of a `slice()` unit.
    ///
    /// The returned record borrows the unit and is not stored in the context.
    /// The rest of the unit past `header_size` bits is macroblock data the
    /// decoder can process once the first macroblock address is known.
    pub fn parse_slice<'a>(&mut self, unit: &'a [u8]) -> Result<Slice<'a>, ParseError> {
        if unit.len() < START_CODE_SIZE + 1 {
            return Err(ParseError::IncompleteHeader);
        }

        debug!("parsing slice header");

        let mut reader = BitReader::new(&unit[START_CODE_PREFIX_SIZE..]);

        let mut slice = Slice {
            vertical_position: unit[START_CODE_PREFIX_SIZE],
            slice_vertical_position_extension: 0,
            macroblock_row: 0,
            macroblock_column: 0,
            quantiser_scale_code: 0,
            intra_slice_flag: false,
            intra_slice: false,
            header_size: 0,
            data: unit,
        };

        reader.skip_byte()?;

        let vertical_size = u32::from(self.sequence_extension.vertical_size_extension & 0x3) << 12
            | u32::from(self.sequence_header.vertical_size_value);

        if vertical_size > 2800 {
            // 8 bits of vertical position are not enough for pictures this
            // tall; 3 more are coded in the slice itself.
            slice.slice_vertical_position_extension = reader.read_bits(3)?;
            slice.macroblock_row = ((u32::from(slice.slice_vertical_position_extension) << 7)
                + u32::from(slice.vertical_position))
            .saturating_sub(1);
        } else {
            slice.macroblock_row = u32::from(slice.vertical_position).saturating_sub(1);
        }

        slice.quantiser_scale_code = reader.read_bits(5)?;

        if reader.peek_marker(true)? {
            slice.intra_slice_flag = reader.read_bit()?;
            slice.intra_slice = reader.read_bit()?;
            reader.skip_bits(7)?;

            // extra_information_slice: each set flag announces one more byte.
            while reader.peek_marker(true)? {
                if !reader.read_bit()? {
                    return Err(ParseError::CorruptExtraBits);
                }
                reader.skip_byte()?;
            }
        }

        // The terminating extra_bit_slice is mandated to be 0.
        if reader.read_bit()? {
            return Err(ParseError::CorruptExtraBits);
        }

        slice.header_size = reader.position() as u32;
        slice.macroblock_column = Self::read_macroblock_address_increment(&mut reader)?;

        Ok(slice)
    }

    /// Classify `unit` and run the matching parse routine, routing extension
    /// units by the identifier nibble following the start code.
    pub fn parse_unit<'a>(&mut self, unit: &'a [u8]) -> Result<ParsedUnit<'a>, ParseError> {
        match classify_unit(unit)? {
            UnitType::SequenceHeader => {
                Ok(ParsedUnit::SequenceHeader(self.parse_sequence_header(unit)?))
            }
            UnitType::Extension => {
                let nibble =
                    *unit.get(START_CODE_SIZE).ok_or(ParseError::IncompleteHeader)? >> 4;
                match ExtensionIdentifier::n(nibble) {
                    Some(ExtensionIdentifier::Sequence) => {
                        Ok(ParsedUnit::SequenceExtension(self.parse_sequence_extension(unit)?))
                    }
                    Some(ExtensionIdentifier::QuantizationMatrix) => Ok(
                        ParsedUnit::QuantMatrixExtension(self.parse_quant_matrix_extension(unit)?),
                    ),
                    Some(ExtensionIdentifier::PictureCoding) => Ok(
                        ParsedUnit::PictureCodingExtension(
                            self.parse_picture_coding_extension(unit)?,
                        ),
                    ),
                    _ => Ok(ParsedUnit::Ignored(UnitType::Extension)),
                }
            }
            UnitType::Group => Ok(ParsedUnit::GopHeader(self.parse_gop_header(unit)?)),
            UnitType::Picture => Ok(ParsedUnit::PictureHeader(self.parse_picture_header(unit)?)),
            UnitType::Slice(_) => Ok(ParsedUnit::Slice(self.parse_slice(unit)?)),
            other => Ok(ParsedUnit::Ignored(other)),
        }
    }
}
