#[rocket::launch]
fn rocket() -> _ {
    chat_vault::init_logger();
    log::info!("starting chat vault API server");
    chat_vault::rocket()
}
