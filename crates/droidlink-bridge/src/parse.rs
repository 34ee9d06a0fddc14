/// Extract serials from `adb devices` output.
///
/// Only devices in the `device` state are usable; `offline`,
/// `unauthorized` and the like are skipped along with the header and
/// daemon start-up chatter.
pub fn parse_devices(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.starts_with('*'))
        .filter(|line| !line.to_lowercase().starts_with("list of devices"))
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            let serial = tokens.next()?;
            let state = tokens.next()?;
            (state == "device").then(|| serial.to_string())
        })
        .collect()
}
