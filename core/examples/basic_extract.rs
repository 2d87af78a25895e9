use pq_explorer::{ExtractConfig, FileStatus, process_path};

fn usage() -> ! {
    eprintln!("Usage: basic_extract <FILE.xlsx|FILE.pbix|FILE.pbit>");
    std::process::exit(2);
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let path = std::env::args().nth(1).unwrap_or_else(|| usage());

    let file = process_path(&path, &ExtractConfig::default())?;
    if file.status != FileStatus::Ok {
        for issue in &file.errors {
            eprintln!("[{}] {}", issue.code, issue.message);
        }
        println!("{}: {:?}", file.name, file.status);
        return Ok(());
    }

    for query in &file.queries {
        println!("// {}", query.name);
        println!("{}\n", query.raw_code);
    }
    Ok(())
}
