//! Plain FTP transport.

use super::{resolve, RemoteTransport};
use crate::config::UploadConfig;
use crate::utils::errors::UploadError;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream, Mode};
use tracing::{debug, warn};

const BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Passive-mode, binary FTP session
pub struct FtpTransport {
    config: UploadConfig,
    stream: Option<FtpStream>,
}

impl FtpTransport {
    pub fn new(config: UploadConfig) -> Self {
        Self {
            config,
            stream: None,
        }
    }
}

impl RemoteTransport for FtpTransport {
    fn connect(&mut self) -> Result<(), UploadError> {
        let addr = resolve(&self.config.host, self.config.port)?;
        let timeout = Duration::from_secs(self.config.timeout_secs);

        let mut stream = FtpStream::connect_timeout(addr, timeout)?;
        stream.get_ref().set_read_timeout(Some(timeout))?;
        stream.get_ref().set_write_timeout(Some(timeout))?;
        // Keep the handle so a failure below still gets a QUIT
        self.stream = Some(stream);
        let stream = self.stream.as_mut().ok_or(UploadError::NotConnected)?;

        stream.set_mode(Mode::Passive);
        stream.login(self.config.user.as_str(), self.config.password.as_str())?;
        stream.transfer_type(FileType::Binary)?;
        if !self.config.remote_path.is_empty() {
            stream.cwd(self.config.remote_path.as_str())?;
        }
        debug!(host = %self.config.host, port = self.config.port, "FTP session established");
        Ok(())
    }

    fn put(&mut self, local: &Path) -> Result<bool, UploadError> {
        let stream = self.stream.as_mut().ok_or(UploadError::NotConnected)?;
        let file_name = super::file_name(local)?;

        let mut reader = BufReader::with_capacity(BUFFER_SIZE, File::open(local)?);
        match stream.put_file(file_name.as_str(), &mut reader) {
            Ok(_) => Ok(true),
            Err(FtpError::UnexpectedResponse(response)) => {
                warn!("FTP server refused to store {}: {:?}", file_name, response);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&mut self, file_name: &str) -> Result<(), UploadError> {
        let stream = self.stream.as_mut().ok_or(UploadError::NotConnected)?;
        stream.rm(file_name)?;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), UploadError> {
        if let Some(mut stream) = self.stream.take() {
            stream.quit()?;
        }
        Ok(())
    }
}
