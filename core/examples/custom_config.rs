use pq_explorer::{ContainerLimits, ExtractConfig, InputFile, process_batch};

fn usage() -> ! {
    eprintln!("Usage: custom_config <FILE>...");
    std::process::exit(2);
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let paths: Vec<String> = std::env::args().skip(1).collect();
    if paths.is_empty() {
        usage();
    }

    let config = ExtractConfig::builder()
        .container_limits(ContainerLimits {
            max_part_uncompressed_bytes: 64 * 1024 * 1024,
            ..ContainerLimits::default()
        })
        .preview_row_limit(50)
        .include_data_model(false)
        .build()?;

    let inputs = paths
        .iter()
        .map(|path| Ok(InputFile::new(path.as_str(), std::fs::read(path)?)))
        .collect::<Result<Vec<_>, std::io::Error>>()?;
    let batch = process_batch(&inputs, &config);

    for file in &batch.files {
        println!("{}: {:?}, {} queries", file.name, file.status, file.queries.len());
    }
    for edge in batch.dependency_graph().cross_file_edges() {
        println!("{} -> {}", edge.from, edge.to);
    }
    Ok(())
}
