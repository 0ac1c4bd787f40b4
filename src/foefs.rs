/*!
    flat file store backing FoE transfers.

    The store is a table of `N` entries, each entry owning one block of [FOE_BLOCK_SIZE] bytes. There is no directory and no allocation: a file never spans more than one block, and the table never grows.

    A file is accessed through a [FileHandle] returned by [FileSystem::open]. Only one handle can exist for a file at a time.
*/

use log::{debug, trace};


/// byte capacity of one file
pub const FOE_BLOCK_SIZE: usize = 2400;
/// maximum byte length of a file name
pub const MAX_FILE_NAME: usize = 10;

pub type FileName = heapless::String<MAX_FILE_NAME>;
/// content of a whole file
pub type FileBlock = heapless::Vec<u8, FOE_BLOCK_SIZE>;

/// build a file name, fails if too long
pub fn file_name(name: &str) -> Result<FileName, FileError> {
    let mut string = FileName::new();
    string.push_str(name).map_err(|_| FileError::NameTooLong)?;
    Ok(string)
}

/// errors of file operations, no operation has any effect when it fails
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum FileError {
    #[error("file name longer than {MAX_FILE_NAME} bytes")]
    NameTooLong,
    #[error("no free entry in the file table")]
    TableFull,
    #[error("no such file")]
    NotFound,
    #[error("handle does not refer to an open file")]
    InvalidHandle,
    #[error("file is opened read-only")]
    AccessDenied,
    #[error("file would exceed its block")]
    Capacity,
    #[error("position outside the file")]
    InvalidOffset,
    #[error("file is already open")]
    Busy,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OpenMode {
    ReadOnly,
    /// creates the file if it does not exist
    ReadWrite,
}

/// origin of a seek
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Whence {
    /// from the start of the file
    Set,
    /// from the current position
    Current,
}

/// which side of the FoE link produced the file
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FileDirection {
    /// file received from the master
    Request = 1,
    /// file to be read by the master
    Commit = 2,
}

/**
    reference to an open file

    It is made of the file's entry in the table and the generation of that entry, so a handle is no longer valid once its file has been closed, even if the entry is reused by another file.
*/
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct FileHandle {
    index: usize,
    generation: u32,
}

impl FileHandle {
    pub fn index(&self) -> usize  {self.index}
}

/// one entry of the file table
#[derive(Clone, Debug)]
pub struct FoeFile {
    name: FileName,
    direction: FileDirection,
    content: FileBlock,
    cursor: usize,
    mode: OpenMode,
    open: bool,
}

impl FoeFile {
    pub fn name(&self) -> &str  {&self.name}
    /// bytes actually stored
    pub fn size(&self) -> usize  {self.content.len()}
    pub fn content(&self) -> &[u8]  {&self.content}
    pub fn direction(&self) -> FileDirection  {self.direction}
    /// position of the next read or write
    pub fn cursor(&self) -> usize  {self.cursor}
    pub fn mode(&self) -> OpenMode  {self.mode}
    pub fn is_open(&self) -> bool  {self.open}
}

/**
    table of files, with `N` entries of [FOE_BLOCK_SIZE] bytes

    ```
    use etherslave::foefs::{FileSystem, OpenMode, Whence};
    let mut fs = FileSystem::<1>::new();
    let file = fs.open("config", OpenMode::ReadWrite).unwrap();
    fs.write(file, b"hello").unwrap();
    fs.seek(file, 0, Whence::Set).unwrap();
    let mut buffer = [0; 8];
    assert_eq!(fs.read(file, &mut buffer).unwrap(), 5);
    ```
*/
pub struct FileSystem<const N: usize = 1> {
    files: heapless::Vec<FoeFile, N>,
    /// incremented each time the handle of an entry is released
    generations: [u32; N],
}

impl<const N: usize> Default for FileSystem<N> {
    fn default() -> Self {Self::new()}
}

impl<const N: usize> FileSystem<N> {
    pub fn new() -> Self {
        Self {files: heapless::Vec::new(), generations: [0; N]}
    }

    /**
        open a file by name and return a handle to it, the cursor is set to the start of the file.

        A missing file is created when opening in [OpenMode::ReadWrite], with direction [FileDirection::Commit]
    */
    pub fn open(&mut self, name: &str, mode: OpenMode) -> Result<FileHandle, FileError> {
        if name.len() > MAX_FILE_NAME
            {return Err(FileError::NameTooLong)}
        let index = match self.files.iter().position(|file| file.name.as_str() == name) {
            Some(index) => {
                if self.files[index].open
                    {return Err(FileError::Busy)}
                index
            },
            None => {
                if mode == OpenMode::ReadOnly
                    {return Err(FileError::NotFound)}
                self.files.push(FoeFile {
                        name: file_name(name)?,
                        direction: FileDirection::Commit,
                        content: FileBlock::new(),
                        cursor: 0,
                        mode,
                        open: false,
                    }).map_err(|_| FileError::TableFull)?;
                debug!("foefs created {:?}", name);
                self.files.len() - 1
            },
        };
        let file = &mut self.files[index];
        file.open = true;
        file.mode = mode;
        file.cursor = 0;
        debug!("foefs opened {:?} {:?}", name, mode);
        Ok(FileHandle {index, generation: self.generations[index]})
    }

    /// release the handle, the content is kept
    pub fn close(&mut self, handle: FileHandle) -> Result<(), FileError> {
        let file = self.file_mut(handle)?;
        file.open = false;
        file.cursor = 0;
        debug!("foefs closed {:?}", file.name);
        self.generations[handle.index] = self.generations[handle.index].wrapping_add(1);
        Ok(())
    }

    /// copy bytes from the cursor into `dst`, return the number of bytes read. It is lower than requested at end of file
    pub fn read(&mut self, handle: FileHandle, dst: &mut [u8]) -> Result<usize, FileError> {
        let file = self.file_mut(handle)?;
        let available = &file.content[file.cursor ..];
        let size = dst.len().min(available.len());
        dst[.. size].copy_from_slice(&available[.. size]);
        file.cursor += size;
        trace!("foefs read {} bytes from {:?}", size, file.name);
        Ok(size)
    }

    /// write all of `data` at the cursor, growing the file if needed. Nothing is written if it does not fit the block
    pub fn write(&mut self, handle: FileHandle, data: &[u8]) -> Result<usize, FileError> {
        let file = self.file_mut(handle)?;
        if file.mode != OpenMode::ReadWrite
            {return Err(FileError::AccessDenied)}
        let end = file.cursor + data.len();
        if end > FOE_BLOCK_SIZE
            {return Err(FileError::Capacity)}
        if end > file.content.len() {
            file.content.resize(end, 0).map_err(|_| FileError::Capacity)?;
        }
        file.content[file.cursor .. end].copy_from_slice(data);
        file.cursor = end;
        trace!("foefs wrote {} bytes to {:?}", data.len(), file.name);
        Ok(data.len())
    }

    /// move the cursor, the new position must stay within the stored bytes
    pub fn seek(&mut self, handle: FileHandle, offset: isize, whence: Whence) -> Result<(), FileError> {
        let file = self.file_mut(handle)?;
        let origin = match whence {
            Whence::Set => 0,
            Whence::Current => file.cursor,
        };
        let position = origin.checked_add_signed(offset)
            .filter(|&position| position <= file.content.len())
            .ok_or(FileError::InvalidOffset)?;
        file.cursor = position;
        Ok(())
    }

    /// erase the content of an open file
    pub fn truncate(&mut self, handle: FileHandle) -> Result<(), FileError> {
        let file = self.file_mut(handle)?;
        if file.mode != OpenMode::ReadWrite
            {return Err(FileError::AccessDenied)}
        file.content.clear();
        file.cursor = 0;
        Ok(())
    }

    /// change the direction tag of an open file
    pub fn set_direction(&mut self, handle: FileHandle, direction: FileDirection) -> Result<(), FileError> {
        self.file_mut(handle)?.direction = direction;
        Ok(())
    }

    /// erase every file, invalidating all handles
    pub fn format(&mut self) {
        debug!("foefs formatted, {} files erased", self.files.len());
        self.files.clear();
        for generation in self.generations.iter_mut() {
            *generation = generation.wrapping_add(1);
        }
    }

    /// number of bytes that can still be stored, in free entries and at the end of existing files
    pub fn available(&self) -> usize {
        N * FOE_BLOCK_SIZE - self.files.iter().map(FoeFile::size).sum::<usize>()
    }

    /// the open file referred by `handle`
    pub fn file(&self, handle: FileHandle) -> Result<&FoeFile, FileError> {
        if self.generations.get(handle.index) != Some(&handle.generation)
            {return Err(FileError::InvalidHandle)}
        self.files.get(handle.index)
            .filter(|file| file.open)
            .ok_or(FileError::InvalidHandle)
    }
    /// find a file by name, open or not
    pub fn find(&self, name: &str) -> Option<&FoeFile> {
        self.files.iter().find(|file| file.name.as_str() == name)
    }
    /// all the files stored
    pub fn files(&self) -> impl Iterator<Item=&FoeFile> {
        self.files.iter()
    }

    fn file_mut(&mut self, handle: FileHandle) -> Result<&mut FoeFile, FileError> {
        if self.generations.get(handle.index) != Some(&handle.generation)
            {return Err(FileError::InvalidHandle)}
        self.files.get_mut(handle.index)
            .filter(|file| file.open)
            .ok_or(FileError::InvalidHandle)
    }
}
