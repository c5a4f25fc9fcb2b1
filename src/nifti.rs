//! Minimal NIfTI-1 codec for the volumes this crate emits and crops.
//!
//! Single-file (`n+1`) little-endian images with three spatial dimensions,
//! plain (`.nii`) or gzip-compressed (`.nii.gz`). Voxels are stored
//! column-major, so a range of the third axis is one contiguous run of
//! bytes and can be read without decoding the slices before it into memory.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::ops::Range;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use ndarray::{Array3, ArrayView3, ShapeBuilder};
use thiserror::Error;

/// Size of NIfTI-1 header in bytes.
pub const HEADER_SIZE: usize = 348;

/// Header plus the empty extension flag.
const DEFAULT_VOX_OFFSET: usize = HEADER_SIZE + 4;

mod offsets {
    pub const SIZEOF_HDR: usize = 0;
    pub const DIM: usize = 40;
    pub const DATATYPE: usize = 70;
    pub const BITPIX: usize = 72;
    pub const PIXDIM: usize = 76;
    pub const VOX_OFFSET: usize = 108;
    pub const SCL_SLOPE: usize = 112;
    pub const SCL_INTER: usize = 116;
    pub const XYZT_UNITS: usize = 123;
    pub const DESCRIP: usize = 148;
    pub const QFORM_CODE: usize = 252;
    pub const SFORM_CODE: usize = 254;
    pub const SROW_X: usize = 280;
    pub const MAGIC: usize = 344;
}

/// Millimetres, in the spatial bits of `xyzt_units`.
const UNITS_MM: u8 = 2;

#[derive(Debug, Error)]
pub enum NiftiError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid NIfTI header: {0}")]
    InvalidHeader(String),

    #[error("Unsupported NIfTI data type code {0}")]
    UnsupportedDataType(i16),

    #[error("Dimension {0} does not fit into a NIfTI-1 header")]
    DimensionTooLarge(usize),

    #[error("Slab {start}..{end} is outside a depth of {depth}")]
    SlabOutOfBounds {
        start: usize,
        end: usize,
        depth: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum DataType {
    UInt8 = 2,
    Int16 = 4,
    Int32 = 8,
    Float32 = 16,
    Float64 = 64,
    UInt16 = 512,
}

impl DataType {
    pub fn from_code(code: i16) -> Result<Self, NiftiError> {
        Ok(match code {
            2 => DataType::UInt8,
            4 => DataType::Int16,
            8 => DataType::Int32,
            16 => DataType::Float32,
            64 => DataType::Float64,
            512 => DataType::UInt16,
            other => return Err(NiftiError::UnsupportedDataType(other)),
        })
    }

    pub fn byte_size(self) -> usize {
        match self {
            DataType::UInt8 => 1,
            DataType::Int16 | DataType::UInt16 => 2,
            DataType::Int32 | DataType::Float32 => 4,
            DataType::Float64 => 8,
        }
    }

    fn decode(self, bytes: &[u8]) -> f32 {
        match self {
            DataType::UInt8 => f32::from(bytes[0]),
            DataType::Int16 => f32::from(LittleEndian::read_i16(bytes)),
            DataType::UInt16 => f32::from(LittleEndian::read_u16(bytes)),
            DataType::Int32 => LittleEndian::read_i32(bytes) as f32,
            DataType::Float32 => LittleEndian::read_f32(bytes),
            DataType::Float64 => LittleEndian::read_f64(bytes) as f32,
        }
    }

    fn encode(self, value: f32, out: &mut [u8]) {
        match self {
            DataType::UInt8 => out[0] = value.round().clamp(0.0, 255.0) as u8,
            DataType::Int16 => LittleEndian::write_i16(out, value.round() as i16),
            DataType::UInt16 => LittleEndian::write_u16(out, value.round() as u16),
            DataType::Int32 => LittleEndian::write_i32(out, value.round() as i32),
            DataType::Float32 => LittleEndian::write_f32(out, value),
            DataType::Float64 => LittleEndian::write_f64(out, f64::from(value)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NiftiHeader {
    pub dim: [usize; 3],
    pub datatype: DataType,
    pub pixdim: [f64; 3],
    /// First three rows of the voxel-to-world affine.
    pub srow: [[f64; 4]; 3],
    pub vox_offset: usize,
    pub scl_slope: f64,
    pub scl_inter: f64,
}

impl NiftiHeader {
    pub fn new(dim: [usize; 3], datatype: DataType, affine: [[f64; 4]; 4]) -> Self {
        let mut header = Self {
            dim,
            datatype,
            pixdim: [1.0; 3],
            srow: [[0.0; 4]; 3],
            vox_offset: DEFAULT_VOX_OFFSET,
            scl_slope: 1.0,
            scl_inter: 0.0,
        };
        header.set_affine(affine);
        header
    }

    pub fn affine(&self) -> [[f64; 4]; 4] {
        [self.srow[0], self.srow[1], self.srow[2], [0.0, 0.0, 0.0, 1.0]]
    }

    /// Sets the sform and derives voxel sizes from the column norms.
    pub fn set_affine(&mut self, affine: [[f64; 4]; 4]) {
        self.srow = [affine[0], affine[1], affine[2]];
        for axis in 0..3 {
            self.pixdim[axis] = (0..3)
                .map(|row| affine[row][axis] * affine[row][axis])
                .sum::<f64>()
                .sqrt();
        }
    }

    /// Bytes occupied by one slice of the third axis.
    pub fn slab_stride(&self) -> usize {
        self.dim[0] * self.dim[1] * self.datatype.byte_size()
    }

    /// Header of the sub-volume covering `z` of this one, origin moved along.
    pub fn slab(&self, z: &Range<usize>) -> Self {
        let mut header = self.clone();
        header.dim[2] = z.end - z.start;
        for row in header.srow.iter_mut() {
            row[3] += row[2] * z.start as f64;
        }
        header.vox_offset = DEFAULT_VOX_OFFSET;
        header
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, NiftiError> {
        use offsets::*;

        if bytes.len() < HEADER_SIZE {
            return Err(NiftiError::InvalidHeader(format!(
                "header too short: {} bytes",
                bytes.len()
            )));
        }
        if LittleEndian::read_i32(&bytes[SIZEOF_HDR..SIZEOF_HDR + 4]) != HEADER_SIZE as i32 {
            return Err(NiftiError::InvalidHeader(
                "sizeof_hdr is not 348 (big-endian or not NIfTI-1)".into(),
            ));
        }
        let magic = &bytes[MAGIC..MAGIC + 4];
        if magic != b"n+1\0" {
            return Err(NiftiError::InvalidHeader(format!("magic {magic:?}")));
        }

        let ndim = LittleEndian::read_i16(&bytes[DIM..DIM + 2]);
        if !(1..=7).contains(&ndim) {
            return Err(NiftiError::InvalidHeader(format!("ndim {ndim}")));
        }
        let mut dim = [1usize; 3];
        for (axis, value) in dim.iter_mut().enumerate().take(ndim.min(3) as usize) {
            let offset = DIM + 2 + axis * 2;
            let raw = LittleEndian::read_i16(&bytes[offset..offset + 2]);
            if raw < 1 {
                return Err(NiftiError::InvalidHeader(format!("dim[{}] = {raw}", axis + 1)));
            }
            *value = raw as usize;
        }
        // trailing dimensions must be singleton
        for axis in 3..ndim as usize {
            let offset = DIM + 2 + axis * 2;
            if LittleEndian::read_i16(&bytes[offset..offset + 2]) > 1 {
                return Err(NiftiError::InvalidHeader("more than 3 dimensions".into()));
            }
        }

        let datatype = DataType::from_code(LittleEndian::read_i16(&bytes[DATATYPE..DATATYPE + 2]))?;
        let mut pixdim = [1.0f64; 3];
        for (axis, value) in pixdim.iter_mut().enumerate() {
            let offset = PIXDIM + (axis + 1) * 4;
            *value = f64::from(LittleEndian::read_f32(&bytes[offset..offset + 4]));
        }

        let mut srow = [[0.0f64; 4]; 3];
        let sform_code = LittleEndian::read_i16(&bytes[SFORM_CODE..SFORM_CODE + 2]);
        if sform_code > 0 {
            for (r, row) in srow.iter_mut().enumerate() {
                for (c, value) in row.iter_mut().enumerate() {
                    let offset = SROW_X + (r * 4 + c) * 4;
                    *value = f64::from(LittleEndian::read_f32(&bytes[offset..offset + 4]));
                }
            }
        } else {
            for (axis, row) in srow.iter_mut().enumerate() {
                row[axis] = pixdim[axis];
            }
        }

        let vox_offset = LittleEndian::read_f32(&bytes[VOX_OFFSET..VOX_OFFSET + 4]);
        let vox_offset = (vox_offset.max(HEADER_SIZE as f32)) as usize;
        let scl_slope = f64::from(LittleEndian::read_f32(&bytes[SCL_SLOPE..SCL_SLOPE + 4]));
        let scl_inter = f64::from(LittleEndian::read_f32(&bytes[SCL_INTER..SCL_INTER + 4]));

        Ok(Self {
            dim,
            datatype,
            pixdim,
            srow,
            vox_offset,
            scl_slope,
            scl_inter,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, NiftiError> {
        use offsets::*;

        let mut buf = vec![0u8; HEADER_SIZE];
        LittleEndian::write_i32(&mut buf[SIZEOF_HDR..SIZEOF_HDR + 4], HEADER_SIZE as i32);

        LittleEndian::write_i16(&mut buf[DIM..DIM + 2], 3);
        for i in 0..7 {
            let value = self.dim.get(i).copied().unwrap_or(1);
            let value = i16::try_from(value).map_err(|_| NiftiError::DimensionTooLarge(value))?;
            let offset = DIM + 2 + i * 2;
            LittleEndian::write_i16(&mut buf[offset..offset + 2], value);
        }

        LittleEndian::write_i16(&mut buf[DATATYPE..DATATYPE + 2], self.datatype as i16);
        LittleEndian::write_i16(
            &mut buf[BITPIX..BITPIX + 2],
            (self.datatype.byte_size() * 8) as i16,
        );

        let mut pixdim = [1.0f32; 8];
        for (axis, value) in self.pixdim.iter().enumerate() {
            pixdim[axis + 1] = *value as f32;
        }
        for (i, value) in pixdim.iter().enumerate() {
            let offset = PIXDIM + i * 4;
            LittleEndian::write_f32(&mut buf[offset..offset + 4], *value);
        }

        LittleEndian::write_f32(&mut buf[VOX_OFFSET..VOX_OFFSET + 4], self.vox_offset as f32);
        LittleEndian::write_f32(&mut buf[SCL_SLOPE..SCL_SLOPE + 4], self.scl_slope as f32);
        LittleEndian::write_f32(&mut buf[SCL_INTER..SCL_INTER + 4], self.scl_inter as f32);
        buf[XYZT_UNITS] = UNITS_MM;

        let descrip = concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION")).as_bytes();
        let len = descrip.len().min(79);
        buf[DESCRIP..DESCRIP + len].copy_from_slice(&descrip[..len]);

        LittleEndian::write_i16(&mut buf[QFORM_CODE..QFORM_CODE + 2], 0);
        LittleEndian::write_i16(&mut buf[SFORM_CODE..SFORM_CODE + 2], 1);
        for (r, row) in self.srow.iter().enumerate() {
            for (c, value) in row.iter().enumerate() {
                let offset = SROW_X + (r * 4 + c) * 4;
                LittleEndian::write_f32(&mut buf[offset..offset + 4], *value as f32);
            }
        }

        buf[MAGIC..MAGIC + 4].copy_from_slice(b"n+1\0");
        Ok(buf)
    }
}

/// A decoded volume; voxel values are the stored values, unscaled.
#[derive(Debug, Clone)]
pub struct NiftiVolume {
    pub header: NiftiHeader,
    pub data: Array3<f32>,
}

fn is_gzip(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gz"))
}

fn open_reader(path: &Path) -> Result<Box<dyn Read>, NiftiError> {
    let file = BufReader::new(File::open(path)?);
    Ok(if is_gzip(path) {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    })
}

fn skip(reader: &mut dyn Read, bytes: usize) -> Result<(), NiftiError> {
    let skipped = io::copy(&mut reader.take(bytes as u64), &mut io::sink())?;
    if skipped != bytes as u64 {
        return Err(NiftiError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "file ends before voxel data",
        )));
    }
    Ok(())
}

fn read_header_from(reader: &mut dyn Read) -> Result<NiftiHeader, NiftiError> {
    let mut bytes = vec![0u8; HEADER_SIZE];
    reader.read_exact(&mut bytes)?;
    NiftiHeader::from_bytes(&bytes)
}

pub fn read_header(path: impl AsRef<Path>) -> Result<NiftiHeader, NiftiError> {
    let mut reader = open_reader(path.as_ref())?;
    read_header_from(&mut reader)
}

pub fn read_volume(path: impl AsRef<Path>) -> Result<NiftiVolume, NiftiError> {
    let path = path.as_ref();
    let depth = read_header(path)?.dim[2];
    read_slab(path, 0..depth)
}

/// Read only slices `z` of the third axis.
pub fn read_slab(path: impl AsRef<Path>, z: Range<usize>) -> Result<NiftiVolume, NiftiError> {
    let mut reader = open_reader(path.as_ref())?;
    let header = read_header_from(&mut reader)?;
    let [nx, ny, nz] = header.dim;
    if z.start > z.end || z.end > nz {
        return Err(NiftiError::SlabOutOfBounds {
            start: z.start,
            end: z.end,
            depth: nz,
        });
    }

    skip(&mut reader, header.vox_offset - HEADER_SIZE + z.start * header.slab_stride())?;
    let mut bytes = vec![0u8; (z.end - z.start) * header.slab_stride()];
    reader.read_exact(&mut bytes)?;

    let size = header.datatype.byte_size();
    let values: Vec<f32> = bytes
        .chunks_exact(size)
        .map(|chunk| header.datatype.decode(chunk))
        .collect();
    let data = Array3::from_shape_vec((nx, ny, z.end - z.start).f(), values)
        .map_err(|e| NiftiError::InvalidHeader(e.to_string()))?;

    Ok(NiftiVolume {
        header: header.slab(&z),
        data,
    })
}

/// Write `data` with `header`; the header's dims are taken from `data`.
pub fn write_volume(
    path: impl AsRef<Path>,
    data: ArrayView3<'_, f32>,
    header: &NiftiHeader,
) -> Result<(), NiftiError> {
    let path = path.as_ref();
    let (nx, ny, nz) = data.dim();
    let mut header = header.clone();
    header.dim = [nx, ny, nz];
    header.vox_offset = DEFAULT_VOX_OFFSET;

    let file = BufWriter::new(File::create(path)?);
    if is_gzip(path) {
        let mut encoder = GzEncoder::new(file, Compression::default());
        write_to(&mut encoder, data, &header)?;
        encoder.finish()?.flush()?;
    } else {
        let mut file = file;
        write_to(&mut file, data, &header)?;
        file.flush()?;
    }
    Ok(())
}

fn write_to(
    writer: &mut impl Write,
    data: ArrayView3<'_, f32>,
    header: &NiftiHeader,
) -> Result<(), NiftiError> {
    writer.write_all(&header.to_bytes()?)?;
    writer.write_all(&[0u8; DEFAULT_VOX_OFFSET - HEADER_SIZE])?;

    let size = header.datatype.byte_size();
    let mut buf = vec![0u8; size];
    // reversed axes iterate the first axis fastest
    for &value in data.t().iter() {
        header.datatype.encode(value, &mut buf);
        writer.write_all(&buf)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn affine(spacing: [f64; 3], origin: [f64; 3]) -> [[f64; 4]; 4] {
        [
            [spacing[0], 0.0, 0.0, origin[0]],
            [0.0, spacing[1], 0.0, origin[1]],
            [0.0, 0.0, spacing[2], origin[2]],
            [0.0, 0.0, 0.0, 1.0],
        ]
    }

    fn ramp(dim: (usize, usize, usize)) -> Array3<f32> {
        Array3::from_shape_fn(dim, |(i, j, k)| (i + 10 * j + 100 * k) as f32)
    }

    #[test]
    fn test_header_bytes() {
        let header = NiftiHeader::new([4, 5, 6], DataType::UInt8, affine([0.9, 0.9, 3.0], [0.0; 3]));
        let bytes = header.to_bytes().unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(&bytes[344..348], b"n+1\0");
        let parsed = NiftiHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.dim, [4, 5, 6]);
        assert_eq!(parsed.datatype, DataType::UInt8);
        assert!((parsed.pixdim[2] - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_rejects_bad_magic() {
        let header = NiftiHeader::new([2, 2, 2], DataType::Float32, affine([1.0; 3], [0.0; 3]));
        let mut bytes = header.to_bytes().unwrap();
        bytes[344..348].copy_from_slice(b"BAD!");
        assert!(matches!(
            NiftiHeader::from_bytes(&bytes),
            Err(NiftiError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_gzip_volume_and_slab() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ramp.nii.gz");
        let data = ramp((3, 4, 5));
        let header = NiftiHeader::new([3, 4, 5], DataType::Int16, affine([1.0, 1.0, 2.5], [-5.0, 0.0, 10.0]));
        write_volume(&path, data.view(), &header).unwrap();

        let volume = read_volume(&path).unwrap();
        assert_eq!(volume.data, data);
        assert_eq!(volume.header.datatype, DataType::Int16);

        let slab = read_slab(&path, 2..4).unwrap();
        assert_eq!(slab.data.dim(), (3, 4, 2));
        assert_eq!(slab.data[[2, 3, 0]], data[[2, 3, 2]]);
        assert_eq!(slab.data[[0, 1, 1]], data[[0, 1, 3]]);
        // the slab origin follows its first slice
        assert!((slab.header.srow[2][3] - 15.0).abs() < 1e-6);
    }

    #[test]
    fn test_plain_file_and_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ramp.nii");
        let data = ramp((2, 2, 3));
        let header = NiftiHeader::new([2, 2, 3], DataType::Float32, affine([1.0; 3], [0.0; 3]));
        write_volume(&path, data.view(), &header).unwrap();

        assert_eq!(read_volume(&path).unwrap().data, data);
        assert!(matches!(
            read_slab(&path, 1..4),
            Err(NiftiError::SlabOutOfBounds { depth: 3, .. })
        ));
    }
}
