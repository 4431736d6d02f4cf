//! Output device discovery for the cpal backend.

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait};

/// Pick an output device by case-insensitive substring match, or the host
/// default when no `needle` is given.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    let Some(needle) = needle else {
        return host
            .default_output_device()
            .ok_or_else(|| anyhow!("no default output device"));
    };

    host.output_devices()
        .context("enumerating output devices")?
        .find(|d| {
            d.description()
                .is_ok_and(|desc| name_matches(&desc.name(), needle))
        })
        .ok_or_else(|| anyhow!("no output device matching '{needle}'"))
}

/// Print the output devices to stdout, flagging the host default.
pub fn list_devices(host: &cpal::Host) -> Result<()> {
    let default = host
        .default_output_device()
        .and_then(|d| d.description().ok())
        .map(|desc| desc.name().to_string());

    let devices = host.output_devices().context("enumerating output devices")?;
    for (i, d) in devices.enumerate() {
        let desc = d.description()?;
        let name = desc.name();
        let marker = if default.as_deref() == Some(&*name) {
            "  (default)"
        } else {
            ""
        };
        println!("{i:>3}  {desc}{marker}");
    }
    Ok(())
}

fn name_matches(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    !needle.is_empty() && name.to_lowercase().contains(&needle.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_matching_is_case_insensitive() {
        assert!(name_matches("USB DAC", "dac"));
        assert!(name_matches("usb dac", "USB"));
        assert!(!name_matches("USB DAC", "speaker"));
    }

    #[test]
    fn empty_or_whitespace_needles_match_nothing() {
        assert!(!name_matches("USB DAC", ""));
        assert!(!name_matches("USB DAC", "   "));
        assert!(name_matches("Built-in Output", "  built-in "));
    }
}
