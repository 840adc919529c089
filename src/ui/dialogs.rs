use gtk4::prelude::*;
use libadwaita::prelude::*;

/// Ask whether to download the model. `on_answer` runs on the GTK main
/// thread; closing the dialog counts as declining.
pub fn ask_download_consent<F>(parent: &libadwaita::ApplicationWindow, url: &str, on_answer: F)
where
    F: FnOnce(bool) + 'static,
{
    let dialog = libadwaita::AlertDialog::builder()
        .heading("Download Model?")
        .body(format!(
            "The separation model was not found on this computer.\n\nDownload it now from\n{url}?"
        ))
        .close_response("cancel")
        .default_response("download")
        .build();
    dialog.add_response("cancel", "Not Now");
    dialog.add_response("download", "Download");
    dialog.set_response_appearance("download", libadwaita::ResponseAppearance::Suggested);

    let parent_widget: Option<&gtk4::Widget> = Some(parent.upcast_ref());
    dialog.choose(parent_widget, None::<&gtk4::gio::Cancellable>, move |response| {
        on_answer(response.as_str() == "download");
    });
}

/// Modal alert with a single OK button.
pub fn show_alert(parent: &libadwaita::ApplicationWindow, heading: &str, body: &str) {
    let dialog = libadwaita::AlertDialog::builder()
        .heading(heading)
        .body(body)
        .build();
    dialog.add_response("ok", "OK");

    let parent_widget: Option<&gtk4::Widget> = Some(parent.upcast_ref());
    dialog.choose(parent_widget, None::<&gtk4::gio::Cancellable>, |_response_id| {});
}

/// Pick a WAV file to separate.
pub fn choose_input_file<F>(parent: &libadwaita::ApplicationWindow, on_chosen: F)
where
    F: FnOnce(std::path::PathBuf) + 'static,
{
    let filter = gtk4::FileFilter::new();
    filter.set_name(Some("WAV audio"));
    filter.add_suffix("wav");
    filter.add_mime_type("audio/x-wav");

    let dialog = gtk4::FileDialog::builder()
        .title("Open Audio File")
        .modal(true)
        .default_filter(&filter)
        .build();

    dialog.open(Some(parent), None::<&gtk4::gio::Cancellable>, move |result| {
        match result {
            Ok(file) => match file.path() {
                Some(path) => on_chosen(path),
                None => log::warn!("Selected file has no local path"),
            },
            Err(e) => log::debug!("File dialog closed: {e}"),
        }
    });
}
