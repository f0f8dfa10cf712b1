fn main() {
    let code = match llb::run::run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("llb: {}", err);
            1
        }
    };
    std::process::exit(code);
}
