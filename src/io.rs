use std::{
    ffi::OsString,
    fs::{self, File},
    io::BufWriter,
    path::{Path, PathBuf},
};

use clap::{value_parser, Arg, ArgAction, Command};
use glam::Vec3;
use log::{info, warn};
use png::Encoder;
use serde::Deserialize;
use serde_json::{from_str, from_value, Map, Value};

use crate::{
    distribution::DistributionKind,
    error::{RenderError, SceneParseError},
    objects::{DiffuseMaterial, GlossyMaterial, Material, MirrorMaterial, Object, Quad, Sphere, Triangle},
    render::{Image, TraceParams, TraceState, TracerKind},
    scene::{Camera, Scene},
};

#[derive(Deserialize, Debug)]
struct SceneParams {
    camera: Value,
    #[serde(default)]
    settings: Option<Value>,
    objects: Map<String, Value>,
}

#[derive(Deserialize, Debug)]
struct CameraParams {
    film_dimensions: [u32; 2],
    origin: [f32; 3],
    look_at: [f32; 3],
    up: [f32; 3],
    field_of_view: f32,
}

#[derive(Deserialize, Debug)]
struct SettingsParams {
    environment: [f32; 3],
}

#[derive(Deserialize, Debug)]
struct SphereParams {
    center: [f32; 3],
    radius: f32,
    material: Value,
}

#[derive(Deserialize, Debug)]
struct TriangleParams {
    point1: [f32; 3],
    point2: [f32; 3],
    point3: [f32; 3],
    material: Value,
}

#[derive(Deserialize, Debug)]
struct QuadParams {
    corner: [f32; 3],
    edge1: [f32; 3],
    edge2: [f32; 3],
    material: Value,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "lowercase")]
enum MaterialParams {
    Diffuse {
        reflectance: [f32; 3],
        #[serde(default)]
        emission: [f32; 3],
    },
    Glossy {
        reflectance: [f32; 3],
        exponent: f32,
        #[serde(default)]
        emission: [f32; 3],
    },
    Mirror {
        reflectance: [f32; 3],
        #[serde(default)]
        emission: [f32; 3],
    },
}

/// Display transform applied when writing an image
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Tonemap {
    pub exposure: f32,
    pub gamma: f32,
    pub filmic: bool,
}

/// Everything the command line decides for one run
#[derive(Debug)]
pub struct Args {
    pub scene: PathBuf,
    pub output: PathBuf,
    pub params: TraceParams,
    pub tonemap: Tonemap,
    pub save_batch: bool,
    pub distribution: DistributionKind,
}

/// Destination for rendered images
pub trait ImageSink {
    fn save(&self, image: &Image, path: &Path) -> Result<(), RenderError>;
}

pub struct PngSink {
    pub tonemap: Tonemap,
}

pub fn read_scene(filename: &Path) -> Result<Scene, SceneParseError> {
    let Ok(scene_json) = fs::read_to_string(filename) else {
        return Err(SceneParseError::new(format!(
            "Couldn't open file at {}",
            filename.display()
        )));
    };

    let scene = parse_scene(&scene_json)?;
    info!(
        "loaded scene {} with {} objects, {} emitters and {} cameras",
        filename.display(),
        scene.objects.len(),
        scene.lights.len(),
        scene.cameras.len()
    );

    Ok(scene)
}

pub fn parse_scene(scene_json: &str) -> Result<Scene, SceneParseError> {
    let Ok(scene_params) = from_str::<SceneParams>(scene_json) else {
        return Err(SceneParseError::new("Scene isn't in valid JSON format"));
    };

    // A single camera object or a list of them
    let cameras = match scene_params.camera {
        Value::Array(values) => values
            .into_iter()
            .map(process_camera)
            .collect::<Result<Vec<_>, _>>()?,
        value => vec![process_camera(value)?],
    };

    if cameras.is_empty() {
        return Err(SceneParseError::new("Scene doesn't define any camera"));
    }

    let environment = match scene_params.settings {
        Some(settings) => {
            let Ok(settings) = from_value::<SettingsParams>(settings) else {
                return Err(SceneParseError::new(
                    "Scene settings aren't correctly formatted",
                ));
            };
            Vec3::from_array(settings.environment)
        }
        None => Vec3::ZERO,
    };

    let mut objects: Vec<Box<dyn Object>> = Vec::new();
    for (name, object_value) in scene_params.objects {
        let object = process_object(&name, object_value)?;
        if object.material().emitted().max_element() > 0.0 && object.area() <= 0.0 {
            warn!("Emitter {} has no area and can't be sampled directly", name);
        }
        objects.push(object);
    }

    if objects.is_empty() {
        warn!("Scene has no objects");
    }

    let scene = Scene::new(cameras, objects, environment);
    if scene.lights.is_empty() && environment.max_element() <= 0.0 {
        warn!("Scene has no emitters and a black environment, the image will be black");
    }

    Ok(scene)
}

fn process_camera(camera_value: Value) -> Result<Camera, SceneParseError> {
    let Ok(camera_params) = from_value::<CameraParams>(camera_value) else {
        return Err(SceneParseError::new(
            "Camera parameters aren't correctly formatted",
        ));
    };

    if camera_params.field_of_view <= 0.0 || camera_params.field_of_view >= 180.0 {
        return Err(SceneParseError::new(
            "Camera field of view must be between 0 and 180 degrees",
        ));
    }

    if camera_params.film_dimensions.contains(&0) {
        return Err(SceneParseError::new("Camera film dimensions must be positive"));
    }

    let origin = Vec3::from_array(camera_params.origin);
    let look_at = Vec3::from_array(camera_params.look_at);
    let up = Vec3::from_array(camera_params.up);
    if (look_at - origin).cross(up).length_squared() <= f32::EPSILON {
        return Err(SceneParseError::new(
            "Camera up vector can't be parallel to the view direction",
        ));
    }

    Ok(Camera::new(
        camera_params.film_dimensions,
        origin,
        look_at,
        up,
        camera_params.field_of_view,
    ))
}

fn process_object(name: &str, mut object_value: Value) -> Result<Box<dyn Object>, SceneParseError> {
    let Some(object_map) = object_value.as_object_mut() else {
        return Err(SceneParseError::new(format!(
            "{} isn't a valid scene object",
            name
        )));
    };

    let Some(object_type) = object_map.remove("type") else {
        return Err(SceneParseError::new(format!(
            "Object {} doesn't have type field",
            name
        )));
    };

    let invalid_material =
        || SceneParseError::new(format!("Object {} has invalid material", name));

    match object_type.as_str() {
        Some("sphere") => {
            let Ok(sphere_params) = from_value::<SphereParams>(object_value) else {
                return Err(SceneParseError::new(format!(
                    "Sphere object {} has invalid parameters",
                    name
                )));
            };

            if sphere_params.radius < 0.0 {
                return Err(SceneParseError::new(format!(
                    "Sphere object {} has negative radius",
                    name
                )));
            }

            let material = process_material(sphere_params.material).ok_or_else(invalid_material)?;
            Ok(Box::new(Sphere::new(
                Vec3::from_array(sphere_params.center),
                sphere_params.radius,
                material,
            )))
        }
        Some("triangle") => {
            let Ok(triangle_params) = from_value::<TriangleParams>(object_value) else {
                return Err(SceneParseError::new(format!(
                    "Triangle object {} has invalid parameters",
                    name
                )));
            };

            let material =
                process_material(triangle_params.material).ok_or_else(invalid_material)?;
            Ok(Box::new(Triangle::new(
                Vec3::from_array(triangle_params.point1),
                Vec3::from_array(triangle_params.point2),
                Vec3::from_array(triangle_params.point3),
                material,
            )))
        }
        Some("quad") => {
            let Ok(quad_params) = from_value::<QuadParams>(object_value) else {
                return Err(SceneParseError::new(format!(
                    "Quad object {} has invalid parameters",
                    name
                )));
            };

            let material = process_material(quad_params.material).ok_or_else(invalid_material)?;
            Ok(Box::new(Quad::new(
                Vec3::from_array(quad_params.corner),
                Vec3::from_array(quad_params.edge1),
                Vec3::from_array(quad_params.edge2),
                material,
            )))
        }
        _ => Err(SceneParseError::new(format!(
            "Object {} has invalid type",
            name
        ))),
    }
}

fn process_material(material_value: Value) -> Option<Box<dyn Material>> {
    let material: Box<dyn Material> = match from_value::<MaterialParams>(material_value).ok()? {
        MaterialParams::Diffuse {
            reflectance,
            emission,
        } => Box::new(DiffuseMaterial::new(
            Vec3::from_array(reflectance),
            Vec3::from_array(emission),
        )),
        MaterialParams::Glossy {
            reflectance,
            exponent,
            emission,
        } => {
            if exponent < 0.0 {
                return None;
            }

            Box::new(GlossyMaterial::new(
                Vec3::from_array(reflectance),
                exponent,
                Vec3::from_array(emission),
            ))
        }
        MaterialParams::Mirror {
            reflectance,
            emission,
        } => Box::new(MirrorMaterial::new(
            Vec3::from_array(reflectance),
            Vec3::from_array(emission),
        )),
    };

    Some(material)
}

fn command() -> Command {
    Command::new("guided-renderer")
        .about("Progressive path tracer with online path guiding")
        .arg(Arg::new("scene").required(true).value_parser(value_parser!(PathBuf)))
        .arg(
            Arg::new("output")
                .short('o')
                .long("output-image")
                .default_value("out.png")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("camera")
                .long("camera")
                .default_value("0")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("resolution")
                .short('r')
                .long("resolution")
                .default_value("512")
                .value_parser(value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new("nsamples")
                .short('s')
                .long("nsamples")
                .default_value("256")
                .value_parser(value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new("tracer")
                .short('t')
                .long("tracer")
                .default_value("path")
                .value_parser(["path", "guided"]),
        )
        .arg(
            Arg::new("nbounces")
                .long("nbounces")
                .default_value("8")
                .value_parser(value_parser!(u32)),
        )
        .arg(
            Arg::new("pixel_clamp")
                .long("pixel-clamp")
                .default_value("100")
                .value_parser(value_parser!(f32)),
        )
        .arg(
            Arg::new("noparallel")
                .long("noparallel")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("seed")
                .long("seed")
                .default_value("13")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("nbatch")
                .short('b')
                .long("nbatch")
                .default_value("16")
                .value_parser(value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new("save_batch")
                .long("save-batch")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("exposure")
                .short('e')
                .long("exposure")
                .default_value("0")
                .allow_negative_numbers(true)
                .value_parser(value_parser!(f32)),
        )
        .arg(
            Arg::new("gamma")
                .short('g')
                .long("gamma")
                .default_value("2.2")
                .value_parser(value_parser!(f32)),
        )
        .arg(Arg::new("filmic").long("filmic").action(ArgAction::SetTrue))
        .arg(
            Arg::new("guiding_distribution")
                .long("guiding-distribution")
                .default_value("histogram")
                .value_parser(["histogram", "vmm"]),
        )
        .arg_required_else_help(true)
}

pub fn read_args() -> Args {
    match args_from(std::env::args_os()) {
        Ok(args) => args,
        Err(error) => error.exit(),
    }
}

pub fn args_from<I, T>(arguments: I) -> Result<Args, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let matches = command().try_get_matches_from(arguments)?;
    let defaults = TraceParams::default();

    let path = |id: &str| matches.get_one::<PathBuf>(id).cloned().unwrap_or_default();
    let number = |id: &str, default: u32| matches.get_one::<u32>(id).copied().unwrap_or(default);
    let float = |id: &str, default: f32| matches.get_one::<f32>(id).copied().unwrap_or(default);
    let choice = |id: &str| matches.get_one::<String>(id).map(String::as_str);

    let tracer = match choice("tracer") {
        Some("guided") => TracerKind::Guided,
        _ => TracerKind::Path,
    };

    let distribution = match choice("guiding_distribution") {
        Some("vmm") => DistributionKind::Vmm,
        _ => DistributionKind::Histogram,
    };

    let params = TraceParams {
        camera: matches.get_one::<usize>("camera").copied().unwrap_or(defaults.camera),
        resolution: number("resolution", defaults.resolution),
        nsamples: number("nsamples", defaults.nsamples),
        nbatch: number("nbatch", defaults.nbatch),
        nbounces: number("nbounces", defaults.nbounces),
        pixel_clamp: float("pixel_clamp", defaults.pixel_clamp),
        seed: matches.get_one::<u64>("seed").copied().unwrap_or(defaults.seed),
        parallel: !matches.get_flag("noparallel"),
        tracer,
    };

    Ok(Args {
        scene: path("scene"),
        output: path("output"),
        params,
        tonemap: Tonemap {
            exposure: float("exposure", 0.0),
            gamma: float("gamma", 2.2),
            filmic: matches.get_flag("filmic"),
        },
        save_batch: matches.get_flag("save_batch"),
        distribution,
    })
}

/// Checkpoint name for `out.png` after 16 samples is `out.16.png`
pub fn checkpoint_filename(output: &Path, sample: u32) -> PathBuf {
    let extension = output
        .extension()
        .map(|extension| extension.to_string_lossy().into_owned())
        .unwrap_or_else(|| "png".to_string());
    output.with_extension(format!("{}.{}", sample, extension))
}

/// Writes the current estimate next to `output`, named after the samples taken so far
pub fn save_checkpoint(
    sink: &impl ImageSink,
    output: &Path,
    state: &TraceState,
) -> Result<PathBuf, RenderError> {
    let filename = checkpoint_filename(output, state.sample());
    sink.save(&state.image(), &filename)?;
    info!("saved checkpoint {}", filename.display());
    Ok(filename)
}

fn filmic_curve(hdr: Vec3) -> Vec3 {
    let hdr = hdr * 0.6;
    (hdr * hdr * 2.51 + hdr * 0.03) / (hdr * hdr * 2.43 + hdr * 0.59 + 0.14)
}

impl Tonemap {
    pub fn apply(&self, radiance: Vec3) -> Vec3 {
        let mut rgb = radiance.max(Vec3::ZERO) * 2f32.powf(self.exposure);
        if self.filmic {
            rgb = filmic_curve(rgb);
        }
        if self.gamma > 0.0 {
            rgb = rgb.powf(1.0 / self.gamma);
        }
        rgb.clamp(Vec3::ZERO, Vec3::ONE)
    }
}

impl ImageSink for PngSink {
    fn save(&self, image: &Image, path: &Path) -> Result<(), RenderError> {
        let rgb_values: Vec<u8> = image
            .pixels
            .iter()
            .flat_map(|rgb| {
                let display = self.tonemap.apply(*rgb);
                [
                    (display.x * 255.0).round() as u8,
                    (display.y * 255.0).round() as u8,
                    (display.z * 255.0).round() as u8,
                ]
            })
            .collect();

        let mut encoder = Encoder::new(
            BufWriter::new(File::create(path)?),
            image.width,
            image.height,
        );

        encoder.set_color(png::ColorType::Rgb);
        encoder.set_depth(png::BitDepth::Eight);
        encoder.write_header()?.write_image_data(&rgb_values)?;

        Ok(())
    }
}
