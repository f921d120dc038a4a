use crate::result::Result;
use anyhow::{bail, ensure, Context};
use byteorder::{BigEndian, ReadBytesExt};
use curl::easy::Easy;
use flate2::read::GzDecoder;
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{ArcArray, ArcArray1, Ix4};
use std::{
    fs::{self, File},
    io::{Read, Write},
    path::Path,
};

/// The kind of Mnist.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MnistKind {
    /// [MNIST](<http://yann.lecun.com/exdb/mnist/>)
    Digits,
    /// [FashionMNIST](<https://github.com/zalandoresearch/fashion-mnist>)
    Fashion,
}

impl MnistKind {
    fn name(&self) -> &'static str {
        match self {
            Self::Digits => "mnist",
            Self::Fashion => "fashion-mnist",
        }
    }
    fn url(&self, file_name: &str) -> String {
        match self {
            Self::Digits => format!("https://ossci-datasets.s3.amazonaws.com/mnist/{file_name}"),
            Self::Fashion => {
                format!("http://fashion-mnist.s3-website.eu-central-1.amazonaws.com/{file_name}")
            }
        }
    }
}

/// Mnist builder.
pub mod builders {
    use super::{Mnist, MnistKind, Result};
    use std::path::Path;

    /// Mnist builder.
    #[derive(Debug)]
    pub struct MnistBuilder<'a> {
        pub(super) path: Option<&'a Path>,
        pub(super) kind: MnistKind,
        pub(super) download: bool,
    }

    impl Default for MnistBuilder<'_> {
        fn default() -> Self {
            Self {
                path: None,
                kind: MnistKind::Digits,
                download: false,
            }
        }
    }

    impl MnistBuilder<'_> {
        /// The path to load the dataset from.
        ///
        /// The files are downloaded to / loaded from "mnist" or "fashion-mnist" in this folder. If not specified, uses the OS specific "Downloads" directory or the "Temp" directory.
        pub fn path(self, path: &Path) -> MnistBuilder {
            MnistBuilder {
                path: Some(path),
                kind: self.kind,
                download: self.download,
            }
        }
        /// The kind of Mnist to use. Defaults to [`MnistKind::Digits`] (ie the original MNIST dataset).
        pub fn kind(self, kind: MnistKind) -> Self {
            Self { kind, ..self }
        }
        /// Whether to download missing files. Defaults to false.
        pub fn download(self, download: bool) -> Self {
            Self { download, ..self }
        }
        /// Builds the dataset.
        ///
        /// **Errors**
        /// - The download failed.
        /// - The files were not found.
        /// - Decompressing / loading the data failed.
        pub fn build(&self) -> Result<Mnist> {
            Mnist::build(self)
        }
    }
}
use builders::MnistBuilder;

const TRAIN_IMAGES: &str = "train-images-idx3-ubyte";
const TRAIN_LABELS: &str = "train-labels-idx1-ubyte";
const TEST_IMAGES: &str = "t10k-images-idx3-ubyte";
const TEST_LABELS: &str = "t10k-labels-idx1-ubyte";

const IMAGES_MAGIC: u32 = 2_051;
const LABELS_MAGIC: u32 = 2_049;

/// The MNIST dataset.
#[derive(Clone, Debug)]
pub struct Mnist {
    kind: MnistKind,
    train_images: ArcArray<u8, Ix4>,
    train_classes: ArcArray1<u8>,
    test_images: ArcArray<u8, Ix4>,
    test_classes: ArcArray1<u8>,
}

impl Mnist {
    /// Returns an [`MnistBuilder`] used to specify options.
    ///
    ///```no_run
    /// # use aae::{
    /// #    result::Result,
    /// #    dataset::mnist::{Mnist, MnistKind},
    /// # };
    /// # use std::path::Path;
    /// # fn main() -> Result<()> {
    /// let mnist = Mnist::builder()
    ///     .path(Path::new("data"))
    ///     .kind(MnistKind::Fashion)
    ///     .download(true)
    ///     .build()?;
    /// # Ok(())
    /// # }
    ///```
    pub fn builder() -> MnistBuilder<'static> {
        MnistBuilder::default()
    }
    fn build(builder: &MnistBuilder) -> Result<Self> {
        let kind = builder.kind;
        let mnist_path = builder
            .path
            .map(Path::to_owned)
            .unwrap_or_else(|| dirs::download_dir().unwrap_or_else(std::env::temp_dir))
            .join(kind.name());
        let names = [TRAIN_IMAGES, TRAIN_LABELS, TEST_IMAGES, TEST_LABELS];
        if builder.download {
            fs::create_dir_all(&mnist_path)?;
            for name in names {
                let path = mnist_path.join(name).with_extension("gz");
                if !path.exists() {
                    let file_name = format!("{name}.gz");
                    download(&kind.url(&file_name), &path)
                        .with_context(|| format!("Downloading {file_name} failed!"))?;
                }
            }
        }
        let load = |name: &str, magic: u32| -> Result<(Vec<usize>, Vec<u8>)> {
            let path = mnist_path.join(name).with_extension("gz");
            let file = File::open(&path)
                .with_context(|| format!("Unable to open {path:?}, try downloading it!"))?;
            read_idx(GzDecoder::new(file), magic).with_context(|| format!("Loading {path:?} failed!"))
        };
        let (train_images, train_classes) =
            images_classes(load(TRAIN_IMAGES, IMAGES_MAGIC)?, load(TRAIN_LABELS, LABELS_MAGIC)?)?;
        let (test_images, test_classes) =
            images_classes(load(TEST_IMAGES, IMAGES_MAGIC)?, load(TEST_LABELS, LABELS_MAGIC)?)?;
        tracing::info!(
            "Loaded {kind:?} from {mnist_path:?}: {} train and {} test images",
            train_images.dim().0,
            test_images.dim().0
        );
        Ok(Self {
            kind,
            train_images,
            train_classes,
            test_images,
            test_classes,
        })
    }
    /// The kind.
    pub fn kind(&self) -> MnistKind {
        self.kind
    }
    /// The training images.
    ///
    /// Shape = \[60_000, 1, 28, 28\].
    pub fn train_images(&self) -> &ArcArray<u8, Ix4> {
        &self.train_images
    }
    /// The training classes.
    ///
    /// Shape = \[60_000\]. The classes range from 0 to 9 inclusive.
    pub fn train_classes(&self) -> &ArcArray1<u8> {
        &self.train_classes
    }
    /// The test images.
    ///
    /// Shape = \[10_000, 1, 28, 28\].
    pub fn test_images(&self) -> &ArcArray<u8, Ix4> {
        &self.test_images
    }
    /// The test classes.
    ///
    /// Shape = \[10_000\].
    pub fn test_classes(&self) -> &ArcArray1<u8> {
        &self.test_classes
    }
}

fn images_classes(
    (image_dims, images): (Vec<usize>, Vec<u8>),
    (label_dims, labels): (Vec<usize>, Vec<u8>),
) -> Result<(ArcArray<u8, Ix4>, ArcArray1<u8>)> {
    ensure!(
        image_dims[1..] == [28, 28],
        "Expected images of size [28, 28], found {:?}!",
        &image_dims[1..]
    );
    ensure!(
        image_dims[0] == label_dims[0],
        "Found {} images but {} labels!",
        image_dims[0],
        label_dims[0]
    );
    if let Some(class) = labels.iter().find(|x| **x > 9) {
        bail!("Found class {class}, expected 0 to 9!");
    }
    let images = ArcArray::from_shape_vec([image_dims[0], 1, image_dims[1], image_dims[2]], images)?;
    let classes = ArcArray::from_shape_vec(label_dims[0], labels)?;
    Ok((images, classes))
}

/// Reads an IDX file of u8's.
///
/// Returns the dims and the data.
fn read_idx(mut reader: impl Read, magic: u32) -> Result<(Vec<usize>, Vec<u8>)> {
    let found = reader.read_u32::<BigEndian>()?;
    ensure!(found == magic, "Expected magic number {magic}, found {found}!");
    let ndim = match magic {
        IMAGES_MAGIC => 3,
        LABELS_MAGIC => 1,
        _ => bail!("Unknown magic number {magic}!"),
    };
    let mut dims = Vec::with_capacity(ndim);
    for _ in 0..ndim {
        dims.push(reader.read_u32::<BigEndian>()? as usize);
    }
    ensure!(!dims.contains(&0), "Found empty dims {dims:?}!");
    let len = dims
        .iter()
        .try_fold(1usize, |len, dim| len.checked_mul(*dim))
        .with_context(|| format!("Dims {dims:?} overflow!"))?;
    let mut data = Vec::new();
    // One extra byte detects trailing data.
    reader
        .take((len as u64).saturating_add(1))
        .read_to_end(&mut data)?;
    ensure!(
        data.len() == len,
        "Expected {len} bytes for dims {dims:?}, found {}!",
        data.len()
    );
    Ok((dims, data))
}

fn download(url: &str, path: &Path) -> Result<()> {
    let part_path = path.with_extension("gz.part");
    let mut file = File::create(&part_path)?;
    let style = ProgressStyle::with_template(
        "{msg} [{elapsed_precise}] [{bar:40}] {bytes}/{total_bytes} ({eta})",
    )?;
    let bar = ProgressBar::new(0).with_style(style);
    bar.set_message(format!("Downloading {url}"));
    let mut easy = Easy::new();
    easy.url(url)?;
    easy.follow_location(true)?;
    easy.fail_on_error(true)?;
    easy.progress(true)?;
    {
        let mut transfer = easy.transfer();
        transfer.write_function(|data| match file.write_all(data) {
            Ok(()) => Ok(data.len()),
            // A short write aborts the transfer.
            Err(_) => Ok(0),
        })?;
        transfer.progress_function(|total, downloaded, _, _| {
            if total > 0. {
                bar.set_length(total as u64);
            }
            bar.set_position(downloaded as u64);
            true
        })?;
        transfer.perform()?;
    }
    let code = easy.response_code()?;
    ensure!(code == 200, "Download of {url} failed with status code {code}!");
    file.flush()?;
    bar.finish();
    fs::rename(&part_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;
    use flate2::{write::GzEncoder, Compression};

    fn write_idx(path: &Path, magic: u32, dims: &[u32], data: &[u8]) -> Result<()> {
        let mut encoder = GzEncoder::new(File::create(path)?, Compression::default());
        encoder.write_u32::<BigEndian>(magic)?;
        for dim in dims {
            encoder.write_u32::<BigEndian>(*dim)?;
        }
        encoder.write_all(data)?;
        encoder.finish()?;
        Ok(())
    }

    fn write_fixture(dir: &Path, train: u32, test: u32) -> Result<()> {
        let mnist_path = dir.join("mnist");
        fs::create_dir_all(&mnist_path)?;
        for (name, n) in [(TRAIN_IMAGES, train), (TEST_IMAGES, test)] {
            let data: Vec<u8> = (0..n * 28 * 28).map(|x| (x % 256) as u8).collect();
            write_idx(
                &mnist_path.join(name).with_extension("gz"),
                IMAGES_MAGIC,
                &[n, 28, 28],
                &data,
            )?;
        }
        for (name, n) in [(TRAIN_LABELS, train), (TEST_LABELS, test)] {
            let data: Vec<u8> = (0..n).map(|x| (x % 10) as u8).collect();
            write_idx(
                &mnist_path.join(name).with_extension("gz"),
                LABELS_MAGIC,
                &[n],
                &data,
            )?;
        }
        Ok(())
    }

    #[test]
    fn load_fixture() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_fixture(dir.path(), 5, 3)?;
        let mnist = Mnist::builder().path(dir.path()).build()?;
        assert_eq!(mnist.kind(), MnistKind::Digits);
        assert_eq!(mnist.train_images().shape(), &[5, 1, 28, 28]);
        assert_eq!(mnist.train_classes().len(), 5);
        assert_eq!(mnist.test_images().shape(), &[3, 1, 28, 28]);
        assert_eq!(mnist.test_classes().to_vec(), [0, 1, 2]);
        assert_eq!(mnist.train_images()[[0, 0, 0, 1]], 1);
        Ok(())
    }

    #[test]
    fn missing_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(Mnist::builder().path(dir.path()).build().is_err());
        Ok(())
    }

    #[test]
    fn read_idx_validates_header() -> Result<()> {
        let mut buffer = Vec::new();
        buffer.write_u32::<BigEndian>(LABELS_MAGIC)?;
        buffer.write_u32::<BigEndian>(3)?;
        buffer.extend([1, 2, 3]);
        let (dims, data) = read_idx(buffer.as_slice(), LABELS_MAGIC)?;
        assert_eq!(dims, [3]);
        assert_eq!(data, [1, 2, 3]);
        // wrong magic
        assert!(read_idx(buffer.as_slice(), IMAGES_MAGIC).is_err());
        // truncated
        assert!(read_idx(&buffer[..buffer.len() - 1], LABELS_MAGIC).is_err());
        // trailing bytes
        buffer.push(4);
        assert!(read_idx(buffer.as_slice(), LABELS_MAGIC).is_err());
        Ok(())
    }

    #[test]
    fn read_idx_rejects_overflowing_dims() -> Result<()> {
        let mut buffer = Vec::new();
        buffer.write_u32::<BigEndian>(IMAGES_MAGIC)?;
        for _ in 0..3 {
            buffer.write_u32::<BigEndian>(u32::MAX)?;
        }
        buffer.extend([0; 16]);
        assert!(read_idx(buffer.as_slice(), IMAGES_MAGIC).is_err());
        Ok(())
    }

    #[test]
    fn rejects_images_not_28x28() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_fixture(dir.path(), 5, 3)?;
        let mnist_path = dir.path().join("mnist");
        write_idx(
            &mnist_path.join(TEST_IMAGES).with_extension("gz"),
            IMAGES_MAGIC,
            &[3, 3, 5],
            &[0; 45],
        )?;
        assert!(Mnist::builder().path(dir.path()).build().is_err());
        let images = (vec![1, 3, 5], vec![0; 15]);
        let labels = (vec![1], vec![0]);
        assert!(images_classes(images, labels).is_err());
        Ok(())
    }

    #[test]
    fn mismatched_labels() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_fixture(dir.path(), 5, 3)?;
        let mnist_path = dir.path().join("mnist");
        write_idx(
            &mnist_path.join(TEST_LABELS).with_extension("gz"),
            LABELS_MAGIC,
            &[2],
            &[0, 1],
        )?;
        assert!(Mnist::builder().path(dir.path()).build().is_err());
        Ok(())
    }
}
