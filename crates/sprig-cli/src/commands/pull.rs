use super::{json_pretty, spin_fail, spin_ok, spinner, EXIT_SUCCESS};
use sprig_core::{RunLayout, RunLock};
use sprig_runtime::{EnsureOutcome, ImageCache, ImageRef, RegistrySource};
use sprig_schema::Settings;
use std::path::Path;

pub fn run(settings: &Settings, workdir: &Path, verify: bool, json: bool) -> Result<u8, String> {
    let layout = RunLayout::new(settings, workdir);
    let image = ImageRef::parse(&settings.image).map_err(|e| e.to_string())?;
    let _lock = RunLock::try_acquire(&layout.lock_path).map_err(|e| e.to_string())?;

    let cache = ImageCache::new(&layout.rootfs);
    let source = RegistrySource::new();
    let pb = spinner(&format!("pulling {image}…"));
    let progress = |msg: &str| pb.set_message(msg.to_owned());
    let outcome = cache
        .ensure_image(&image, &source, verify || settings.verify_image, &progress)
        .map_err(|e| {
            spin_fail(&pb, "pull failed");
            e.to_string()
        })?;
    spin_ok(&pb, "pull complete");

    let layers = match outcome {
        EnsureOutcome::Cached => None,
        EnsureOutcome::Extracted { layers } => Some(layers),
    };
    if json {
        let payload = serde_json::json!({
            "image": image.to_string(),
            "rootfs": layout.rootfs.display().to_string(),
            "cached": layers.is_none(),
            "layers_extracted": layers.unwrap_or(0),
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        match layers {
            None => println!("{image} already cached in {}", layout.rootfs.display()),
            Some(n) => println!("extracted {image} ({n} layers) to {}", layout.rootfs.display()),
        }
    }
    Ok(EXIT_SUCCESS)
}
