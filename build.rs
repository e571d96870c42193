fn main() {
    built::write_built_file().expect("Failed to record build-time information for fgmarkdup");
}
