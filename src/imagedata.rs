use crate::{CapturedFrame, Error, FrameMetadata};
use image::{DynamicImage, GrayImage, ImageBuffer, Luma, RgbImage};
use std::fmt::Display;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[cfg(feature = "fitsio")]
use log::{info, warn};
#[cfg(feature = "fitsio")]
use std::path::{Path, PathBuf};

#[derive(Clone, Debug)]
#[deny(missing_docs)]
/// Acquisition details carried alongside a converted frame.
pub struct ImageMetaData {
    /// Binning factor
    pub bin: u32,
    /// First row of the frame on the sensor (un-binned pixels)
    pub img_top: u32,
    /// First column of the frame on the sensor (un-binned pixels)
    pub img_left: u32,
    /// Requested exposure
    pub exposure: Duration,
    /// Shutter opening if a GPS header was decoded, otherwise the time the frame was received
    pub timestamp: SystemTime,
    /// Camera that produced the frame
    pub camera_name: String,
    /// Decoded GPS timing header
    pub gps: Option<FrameMetadata>,
    tags: Vec<(String, String)>,
}

impl ImageMetaData {
    /// Metadata for a frame from `camera_name`, with no tags.
    pub fn new(timestamp: SystemTime, exposure: Duration, bin: u32, camera_name: &str) -> Self {
        Self {
            bin,
            timestamp,
            exposure,
            camera_name: camera_name.into(),
            ..Default::default()
        }
    }

    /// Append a key/value tag. Keys are written verbatim as FITS header keys.
    pub fn add_extended_attrib(&mut self, key: &str, val: &str) {
        self.tags.push((key.into(), val.into()));
    }

    /// All tags, in insertion order.
    pub fn extended_attribs(&self) -> &[(String, String)] {
        &self.tags
    }

    /// First tag named `key`.
    pub fn get_extended_attrib(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find_map(|(k, v)| (k == key).then_some(v.as_str()))
    }

    /// Attach a decoded GPS header, tagging its sequence, location and shutter times.
    ///
    /// The timestamp moves to the shutter opening reported by the timing module.
    pub fn set_gps(&mut self, gps: FrameMetadata) {
        self.add_extended_attrib("GPS_SEQ", &gps.sequence.to_string());
        self.add_extended_attrib("GPS_LAT", &format!("{:.6}", gps.latitude));
        self.add_extended_attrib("GPS_LON", &format!("{:.6}", gps.longitude));
        self.add_extended_attrib("GPS_ST", &gps.start.iso8601());
        self.add_extended_attrib("GPS_ET", &gps.end.iso8601());
        self.add_extended_attrib("GPS_EXP", &format!("{:.7}", gps.measured_exposure()));
        if let Some(state) = gps.gps_state() {
            self.add_extended_attrib("GPS_STAT", &format!("{:?}", state));
        }
        if let Some(start) = gps.start.to_datetime() {
            self.timestamp = start.into();
        }
        self.gps = Some(gps);
    }
}

impl Default for ImageMetaData {
    fn default() -> Self {
        Self {
            bin: 1,
            img_top: 0,
            img_left: 0,
            exposure: Duration::ZERO,
            timestamp: UNIX_EPOCH,
            camera_name: String::new(),
            gps: None,
            tags: Vec::new(),
        }
    }
}

impl Display for ImageMetaData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{} frame at {:?}:", self.camera_name, self.timestamp)?;
        writeln!(
            f,
            "\tOrigin ({}, {}), bin {}",
            self.img_left, self.img_top, self.bin
        )?;
        writeln!(f, "\tExposure: {} s", self.exposure.as_secs_f64())?;
        for (key, val) in self.tags.iter() {
            writeln!(f, "\t{} = {}", key, val)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
/// A captured frame decoded into an [`image::DynamicImage`], with its metadata.
pub struct ImageData {
    img: DynamicImage,
    meta: ImageMetaData,
}

impl Display for ImageData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.meta)?;
        write!(f, "\t{} x {} pixels", self.img.width(), self.img.height())
    }
}

impl ImageData {
    /// Pair an image with its metadata.
    pub fn new(img: DynamicImage, meta: ImageMetaData) -> Self {
        Self { img, meta }
    }

    /// Append a tag to the metadata.
    pub fn add_extended_attrib(&mut self, key: &str, val: &str) {
        self.meta.add_extended_attrib(key, val);
    }

    /// The frame metadata.
    pub fn get_metadata(&self) -> &ImageMetaData {
        &self.meta
    }

    /// The decoded image.
    pub fn get_image(&self) -> &DynamicImage {
        &self.img
    }

    /// Write the image as a FITS primary image named `{prefix}_{millis}.fits` in `dir`.
    ///
    /// The prefix falls back to the camera name when blank. Monochrome images are
    /// written as 8- or 16-bit unsigned data; the metadata and every tag become
    /// header keys.
    ///
    /// # Errors
    /// [`Error::Message`] if `dir` is missing, the file exists and `overwrite` is
    /// false, the image is not monochrome, or cfitsio reports a failure.
    #[cfg(feature = "fitsio")]
    pub fn save_fits(
        &self,
        dir: &Path,
        prefix: &str,
        progname: &str,
        overwrite: bool,
    ) -> Result<PathBuf, Error> {
        use fitsio::images::{ImageDescription, ImageType};
        use fitsio::FitsFile;

        let fits_err = |e: fitsio::errors::Error| Error::Message(format!("FITS: {}", e));

        if !dir.is_dir() {
            return Err(Error::Message(format!("{} is not a directory", dir.display())));
        }
        let millis = self
            .meta
            .timestamp
            .duration_since(UNIX_EPOCH)
            .map_err(|_| Error::Message(format!("Timestamp {:?} predates 1970", self.meta.timestamp)))?
            .as_millis();
        let prefix = match prefix.trim() {
            "" if self.meta.camera_name.is_empty() => "frame",
            "" => self.meta.camera_name.as_str(),
            p => p,
        };
        let path = dir.join(format!("{}_{}.fits", prefix, millis));
        if path.exists() {
            if !overwrite {
                return Err(Error::Message(format!("{} exists", path.display())));
            }
            warn!("Replacing {}", path.display());
            std::fs::remove_file(&path)
                .map_err(|e| Error::Message(format!("Removing {}: {}", path.display(), e)))?;
        }

        let data_type = match self.img.color() {
            image::ColorType::L8 => ImageType::UnsignedByte,
            image::ColorType::L16 => ImageType::UnsignedShort,
            other => return Err(Error::Message(format!("Cannot write {:?} to FITS", other))),
        };
        let dimensions = [self.img.height() as usize, self.img.width() as usize];
        let description = ImageDescription {
            data_type,
            dimensions: &dimensions,
        };
        let mut fits = FitsFile::create(&path).open().map_err(fits_err)?;
        let hdu = fits
            .create_image("FRAME".to_string(), &description)
            .map_err(fits_err)?;
        let written = match self.img.color() {
            image::ColorType::L8 => hdu.write_image(&mut fits, self.img.to_luma8().as_raw()),
            _ => hdu.write_image(&mut fits, self.img.to_luma16().as_raw()),
        };
        written.map_err(fits_err)?;

        let meta = &self.meta;
        hdu.write_key(&mut fits, "PROGRAM", progname).map_err(fits_err)?;
        hdu.write_key(&mut fits, "CAMERA", meta.camera_name.as_str()).map_err(fits_err)?;
        hdu.write_key(&mut fits, "TIMESTAMP", millis as u64).map_err(fits_err)?;
        hdu.write_key(&mut fits, "EXPTIME", meta.exposure.as_secs_f64()).map_err(fits_err)?;
        hdu.write_key(&mut fits, "XORGSUBF", meta.img_left).map_err(fits_err)?;
        hdu.write_key(&mut fits, "YORGSUBF", meta.img_top).map_err(fits_err)?;
        hdu.write_key(&mut fits, "XBINNING", meta.bin).map_err(fits_err)?;
        hdu.write_key(&mut fits, "YBINNING", meta.bin).map_err(fits_err)?;
        for (key, val) in meta.tags.iter() {
            hdu.write_key(&mut fits, key, val.as_str()).map_err(fits_err)?;
        }
        info!("Saved {}", path.display());
        Ok(path)
    }
}

impl CapturedFrame {
    /// Convert the raw buffer into an [`ImageData`] tagged with the frame's metadata.
    ///
    /// Supports 8- and 16-bit (little-endian) monochrome and 8-bit RGB frames.
    ///
    /// # Errors
    ///  - [`Error::InvalidSize`] if the buffer is shorter than the reported geometry.
    ///  - [`Error::InvalidValue`] for other pixel layouts.
    pub fn to_image_data(&self, camera_name: &str) -> Result<ImageData, Error> {
        let info = self.info;
        let len = info.byte_len();
        let data = self
            .data
            .get(..len)
            .ok_or(Error::InvalidSize(self.data.len()))?;
        let size_err = || Error::InvalidSize(self.data.len());
        let img = match (info.bpp, info.channels) {
            (8, 1) => DynamicImage::ImageLuma8(
                GrayImage::from_raw(info.width, info.height, data.to_vec()).ok_or_else(size_err)?,
            ),
            (16, 1) => {
                let pixels: Vec<u16> = data
                    .chunks_exact(2)
                    .map(|px| u16::from_le_bytes([px[0], px[1]]))
                    .collect();
                DynamicImage::ImageLuma16(
                    ImageBuffer::<Luma<u16>, Vec<u16>>::from_raw(info.width, info.height, pixels)
                        .ok_or_else(size_err)?,
                )
            }
            (8, 3) => DynamicImage::ImageRgb8(
                RgbImage::from_raw(info.width, info.height, data.to_vec()).ok_or_else(size_err)?,
            ),
            (bpp, channels) => {
                return Err(Error::InvalidValue(format!(
                    "Unsupported pixel layout: {} bits x {} channels",
                    bpp, channels
                )))
            }
        };
        let mut meta = ImageMetaData::new(
            self.received,
            Duration::try_from_secs_f64(self.exposure).unwrap_or_default(),
            self.roi.bin.max(1),
            camera_name,
        );
        meta.img_left = self.roi.x_min;
        meta.img_top = self.roi.y_min;
        if let Some(gps) = self.metadata {
            meta.set_gps(gps);
        }
        Ok(ImageData::new(img, meta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FrameInfo, FrameKind, ROI};

    fn frame(bpp: u32, channels: u32, data: Vec<u8>) -> CapturedFrame {
        CapturedFrame {
            kind: FrameKind::Exposure,
            data,
            info: FrameInfo {
                width: 4,
                height: 2,
                bpp,
                channels,
            },
            roi: ROI::full(4, 2),
            metadata: None,
            exposure: 1.5,
            received: UNIX_EPOCH + Duration::from_secs(1_700_000_000),
        }
    }

    #[test]
    fn test_luma16_little_endian() {
        let mut data = Vec::new();
        for v in 0u16..8 {
            data.extend_from_slice(&(v * 1000).to_le_bytes());
        }
        let img = frame(16, 1, data).to_image_data("cam").unwrap();
        let luma = img.get_image().to_luma16();
        assert_eq!(luma.get_pixel(3, 1).0[0], 7000);
        assert_eq!(img.get_metadata().exposure, Duration::from_millis(1500));
        assert_eq!(img.get_metadata().camera_name, "cam");
    }

    #[test]
    fn test_region_and_binning_carried() {
        let mut f = frame(8, 1, vec![0; 8]);
        f.roi = ROI {
            x_min: 100,
            y_min: 40,
            width: 8,
            height: 4,
            bin: 2,
        };
        let img = f.to_image_data("cam").unwrap();
        let meta = img.get_metadata();
        assert_eq!((meta.img_left, meta.img_top, meta.bin), (100, 40, 2));
        assert!(img.to_string().contains("Origin (100, 40), bin 2"));
    }

    #[test]
    fn test_rgb8() {
        let img = frame(8, 3, (0..24).collect()).to_image_data("cam").unwrap();
        assert_eq!(img.get_image().color(), image::ColorType::Rgb8);
        assert_eq!(img.get_image().to_rgb8().get_pixel(1, 0).0, [3, 4, 5]);
    }

    #[test]
    fn test_short_buffer() {
        let err = frame(8, 1, vec![0; 7]).to_image_data("cam").unwrap_err();
        assert_eq!(err, Error::InvalidSize(7));
    }

    #[test]
    fn test_unsupported_layout() {
        let err = frame(12, 1, vec![0; 64]).to_image_data("cam").unwrap_err();
        assert!(matches!(err, Error::InvalidValue(_)));
    }

    #[test]
    fn test_gps_tags() {
        let mut header = vec![0u8; 64];
        header[0..4].copy_from_slice(&9u32.to_be_bytes());
        header[9..13].copy_from_slice(&1_200_000_000u32.to_be_bytes());
        header[17] = 1;
        header[18..22].copy_from_slice(&1000u32.to_be_bytes());
        header[22..25].copy_from_slice(&500_000u32.to_be_bytes()[1..]);
        let mut f = frame(8, 1, header.clone());
        f.info.width = 8;
        f.info.height = 8;
        f.metadata = Some(FrameMetadata::decode(&header).unwrap());
        let img = f.to_image_data("cam").unwrap();
        let meta = img.get_metadata();
        assert_eq!(meta.get_extended_attrib("GPS_SEQ"), Some("9"));
        assert_eq!(meta.get_extended_attrib("GPS_LAT"), Some("-20.000000"));
        assert_eq!(
            meta.get_extended_attrib("GPS_ST"),
            Some("1995-10-10T00:16:40.050")
        );
        let since = meta.timestamp.duration_since(UNIX_EPOCH).unwrap();
        assert_eq!(since.as_secs(), 9413 * 86400 + 1000);
        assert!(img.to_string().contains("GPS_ET"));
    }
}
