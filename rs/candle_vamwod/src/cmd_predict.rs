//! Predict subcommand: label the candidate boxes of one screenshot.

use std::path::{Path, PathBuf};
use std::time::Instant;

use candle_core::{DType, Device, Result, D};
use candle_nn::VarBuilder;
use clap::Args;
use image::DynamicImage;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;
use webtools::{top_box_per_class, BBox, BackgroundCap, Split, BACKGROUND_LABEL};

use crate::config::VamwodConfig;
use crate::dataset::{collate, SampleLoader};
use crate::model::Vamwod;

/// Arguments for the predict subcommand
#[derive(Args, Debug)]
pub struct PredictArgs {
    /// Screenshot to process.
    pub image: PathBuf,

    /// Candidate boxes; defaults to the image path with a `.json` extension.
    #[arg(long)]
    pub boxes: Option<PathBuf>,

    /// The height of the legend bar above each box, 0 means no legend.
    #[arg(long, default_value_t = 6)]
    pub legend_size: u32,
}

/// Color palette indexed by class id
const CLASS_COLORS: [[u8; 3]; 8] = [
    [192, 192, 192], // silver
    [255, 64, 64],   // red
    [50, 170, 255],  // sky blue
    [50, 255, 50],   // green
    [255, 161, 54],  // orange
    [161, 50, 255],  // purple
    [255, 221, 51],  // yellow
    [50, 255, 255],  // cyan
];

fn get_class_color(class_id: usize) -> image::Rgb<u8> {
    image::Rgb(CLASS_COLORS[class_id % CLASS_COLORS.len()])
}

/// Get a darker version of a color for the legend bar
fn get_darker_color(color: image::Rgb<u8>) -> image::Rgb<u8> {
    image::Rgb(color.0.map(|c| (c as u16 * 2 / 3) as u8))
}

/// Best box for one foreground class
#[derive(Debug, Clone)]
pub struct Detection {
    pub class_id: usize,
    /// Index of the box in the sample's box list
    pub box_index: usize,
    /// Corners in original image pixels
    pub bbox: BBox,
    /// Softmax probability of `class_id` for this box
    pub score: f32,
}

pub fn load_model(model_path: &Path, config: &VamwodConfig, device: &Device) -> Result<Vamwod> {
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[model_path], DType::F32, device)? };
    Vamwod::load(vb, config)
}

/// Pick the top-scoring box of every foreground class.
///
/// `scores` is `[n_boxes][n_classes]` of probabilities, `boxes` the matching
/// boxes in original image coordinates.
pub fn select_detections(scores: &[Vec<f32>], boxes: &[BBox], n_classes: usize) -> Vec<Detection> {
    top_box_per_class(scores, n_classes)
        .into_iter()
        .enumerate()
        .filter(|&(class_id, _)| class_id as u32 != BACKGROUND_LABEL)
        .filter_map(|(class_id, top)| {
            top.map(|box_index| Detection {
                class_id,
                box_index,
                bbox: boxes[box_index],
                score: scores[box_index][class_id],
            })
        })
        .collect()
}

/// Run the model on one screenshot and its candidate boxes
pub fn predict_image(
    model: &Vamwod,
    image_path: &Path,
    boxes_path: &Path,
    device: &Device,
) -> anyhow::Result<Vec<Detection>> {
    let config = model.config();
    let loader = SampleLoader::new(
        Path::new("."),
        Split::Test,
        BackgroundCap::Unlimited,
        config.img_size,
        config.normalize_input,
        device,
    )?;
    let id = image_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let sample = loader.load_paths(&id, image_path, boxes_path, &mut StdRng::seed_from_u64(0))?;

    let (width, height) = image::image_dimensions(image_path)?;
    let sx = width as f32 / config.img_size as f32;
    let sy = height as f32 / config.img_size as f32;
    let boxes: Vec<BBox> = sample.boxes.boxes.iter().map(|b| b.scale(sx, sy)).collect();
    info!("{} candidate boxes", boxes.len());

    let batch = collate(std::slice::from_ref(&sample), config.n_context, device)?;
    let logits = model.forward_t(&batch.images, &batch.boxes, None, &batch.context, false)?;
    let scores: Vec<Vec<f32>> = candle_nn::ops::softmax(&logits, D::Minus1)?.to_vec2()?;

    Ok(select_detections(&scores, &boxes, config.n_classes))
}

/// Draw detections on an image
fn draw_detections(img: DynamicImage, detections: &[Detection], legend_size: u32) -> DynamicImage {
    let mut img = img.to_rgb8();

    for det in detections {
        let [x1, y1, _, _] = det.bbox.to_array();
        let (x1, y1) = (x1 as i32, y1 as i32);
        let dx = det.bbox.width().max(0.0) as u32;
        let dy = det.bbox.height().max(0.0) as u32;

        let box_color = get_class_color(det.class_id);

        if dx > 0 && dy > 0 {
            imageproc::drawing::draw_hollow_rect_mut(
                &mut img,
                imageproc::rect::Rect::at(x1, y1).of_size(dx, dy),
                box_color,
            );
        }

        if legend_size > 0 && dx > 0 {
            imageproc::drawing::draw_filled_rect_mut(
                &mut img,
                imageproc::rect::Rect::at(x1, y1 - legend_size as i32).of_size(dx, legend_size),
                get_darker_color(box_color),
            );
        }
    }

    DynamicImage::ImageRgb8(img)
}

/// Run the predict subcommand
pub fn run(
    args: &PredictArgs,
    config: &VamwodConfig,
    model_path: &Path,
    device: &Device,
) -> anyhow::Result<()> {
    if config.n_additional_feat > 0 {
        anyhow::bail!("the sample format carries no additional box features");
    }
    let boxes_path = args
        .boxes
        .clone()
        .unwrap_or_else(|| args.image.with_extension("json"));

    info!("loading model from {model_path:?}");
    let start = Instant::now();
    let model = load_model(model_path, config, device)?;
    info!("model loaded in {:?}", start.elapsed());

    let start = Instant::now();
    let detections = predict_image(&model, &args.image, &boxes_path, device)?;
    info!("inference completed in {:?}", start.elapsed());

    for det in &detections {
        let [x1, y1, x2, y2] = det.bbox.to_array();
        info!(
            "{}: box {} ({:.1}, {:.1}, {:.1}, {:.1}) conf: {:.2}",
            config.class_name(det.class_id),
            det.box_index,
            x1,
            y1,
            x2,
            y2,
            det.score
        );
    }

    let img = image::ImageReader::open(&args.image)?.decode()?;
    let annotated = draw_detections(img, &detections, args.legend_size);
    let output_path = args.image.with_extension("out.png");
    annotated.save(&output_path)?;
    info!("annotated image saved to {output_path:?}");

    Ok(())
}
