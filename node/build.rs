fn main() {
    // Link arguments and cfgs exported by esp-idf-sys; host builds have none.
    if std::env::var_os("CARGO_FEATURE_ESP32").is_some() {
        embuild::espidf::sysenv::output();
    }
}
