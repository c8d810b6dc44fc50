use std::collections::BTreeSet;

use chrono::Utc;
use gemlog_api::{
    assemble_threads, hash_password, verify_password, AuthToken, Comment, CommentEdit, CommentId,
    CommentThread, Credentials, Error, Followers, Following, Message, NewComment, NewPost,
    NewReply, NewUser, Post, PostId, PostList, PostPage, PostPatch, PostQuery, Profile,
    ProfilePicture, ProfileUpdate, ProfileUpdated, Reaction, Registered, RegisteredUser,
    SearchHit, Session, SessionKey, SortKey, Time, UserId, UserSearch, UserSummary, Uuid,
    DELETED_COMMENT, DELETED_REPLY, SEARCH_RESULTS_LIMIT,
};

/// Tests have no use for expensive hashes
const MOCK_BCRYPT_COST: u32 = 4;

#[derive(Debug)]
struct MockUser {
    id: UserId,
    email: String,
    username: String,
    password_hash: String,
    profile_picture: Option<String>,
    created_at: Time,
    updated_at: Time,
}

#[derive(Debug)]
struct MockPost {
    id: PostId,
    seq: u64,
    owner: UserId,
    title: String,
    content: String,
    images: Vec<String>,
    created_at: Time,
    updated_at: Time,
}

#[derive(Debug)]
struct MockComment {
    id: CommentId,
    seq: u64,
    post: PostId,
    author: UserId,
    parent: Option<CommentId>,
    content: String,
    is_deleted: bool,
    deleted_at: Option<Time>,
    created_at: Time,
    updated_at: Time,
}

/// In-memory model of the whole service
///
/// Every method returns what the matching HTTP route answers, errors
/// included. Collections are kept in insertion order, which is the
/// order the server falls back to when timestamps tie.
pub struct MockServer {
    key: SessionKey,
    thread_depth: usize,
    next_seq: u64,
    users: Vec<MockUser>,
    // (follower, followee)
    follows: Vec<(UserId, UserId)>,
    posts: Vec<MockPost>,
    // (post, user, liked)
    reactions: Vec<(PostId, UserId, bool)>,
    comments: Vec<MockComment>,
    files: BTreeSet<String>,
}

fn internal(message: &str, err: impl std::fmt::Display) -> Error {
    Error::Unknown {
        message: String::from(message),
        error: err.to_string(),
    }
}

impl MockServer {
    pub fn new(key: SessionKey, thread_depth: usize) -> MockServer {
        MockServer {
            key,
            thread_depth,
            next_seq: 0,
            users: Vec::new(),
            follows: Vec::new(),
            posts: Vec::new(),
            reactions: Vec::new(),
            comments: Vec::new(),
            files: BTreeSet::new(),
        }
    }

    fn seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Return the current number of users
    pub fn test_num_users(&self) -> usize {
        self.users.len()
    }

    /// Return id & email of user number `idx`, in registration order
    pub fn test_get_user_info(&self, idx: usize) -> (UserId, &str) {
        let u = self
            .users
            .get(idx)
            .unwrap_or_else(|| panic!("getting user {idx} among {}", self.users.len()));
        (u.id, &u.email)
    }

    /// Return the stored password hash of a user
    pub fn test_password_hash(&self, email: &str) -> Option<&str> {
        self.users
            .iter()
            .find(|u| u.email == email)
            .map(|u| &u.password_hash as &str)
    }

    /// Return the current number of posts
    pub fn test_num_posts(&self) -> usize {
        self.posts.len()
    }

    /// Return the id of post number `idx`, in creation order
    pub fn test_get_post_id(&self, idx: usize) -> PostId {
        self.posts[idx].id
    }

    /// Return the current number of comments, deleted ones included
    pub fn test_num_comments(&self) -> usize {
        self.comments.len()
    }

    /// Return the id of comment number `idx`, in creation order
    pub fn test_get_comment_id(&self, idx: usize) -> CommentId {
        self.comments[idx].id
    }

    /// Return a comment even if it was deleted
    pub fn test_comment(&self, id: CommentId) -> Option<Comment> {
        self.comments
            .iter()
            .find(|c| c.id == id)
            .map(|c| self.comment_view(c))
    }

    /// Upload references currently held by users or posts
    pub fn test_stored_files(&self) -> &BTreeSet<String> {
        &self.files
    }

    fn authenticate(&self, tok: &AuthToken) -> Result<UserId, Error> {
        self.key.verify(&tok.0)
    }

    fn user(&self, id: UserId) -> Result<&MockUser, Error> {
        self.users
            .iter()
            .find(|u| u.id == id)
            .ok_or_else(Error::user_not_found)
    }

    fn user_mut(&mut self, id: UserId) -> Result<&mut MockUser, Error> {
        self.users
            .iter_mut()
            .find(|u| u.id == id)
            .ok_or_else(Error::user_not_found)
    }

    fn summary(&self, id: UserId) -> UserSummary {
        let u = self
            .user(id)
            .unwrap_or_else(|_| panic!("dangling reference to user {:?}", id));
        UserSummary {
            id: u.id,
            email: u.email.clone(),
            username: u.username.clone(),
            profile_picture: u.profile_picture.clone(),
        }
    }

    pub fn register(&mut self, u: NewUser) -> Result<Registered, Error> {
        u.validate()?;
        if let Some(existing) = self
            .users
            .iter()
            .find(|e| e.email == u.email)
            .or_else(|| self.users.iter().find(|e| e.username == u.username))
        {
            return Err(Error::conflict(match existing.email == u.email {
                true => "Email already exists",
                false => "Username already exists",
            }));
        }
        let password_hash = hash_password(&u.password, MOCK_BCRYPT_COST)
            .map_err(|e| internal("Failed to register user", e))?;
        let now = Utc::now();
        let id = UserId(Uuid::new_v4());
        self.users.push(MockUser {
            id,
            email: u.email.clone(),
            username: u.username.clone(),
            password_hash,
            profile_picture: None,
            created_at: now,
            updated_at: now,
        });
        Ok(Registered {
            message: String::from("User registered successfully"),
            user: RegisteredUser {
                id,
                email: u.email,
                username: u.username,
            },
        })
    }

    pub fn login(&self, c: Credentials) -> Result<Session, Error> {
        c.validate()?;
        let u = self
            .users
            .iter()
            .find(|u| u.email == c.email)
            .ok_or(Error::InvalidCredentials)?;
        if !verify_password(&c.password, &u.password_hash) {
            return Err(Error::InvalidCredentials);
        }
        let token = self
            .key
            .issue(u.id, Utc::now())
            .map_err(|e| internal("Failed to login", e))?;
        Ok(Session {
            token,
            user: self.summary(u.id),
        })
    }

    fn profile_of(&self, id: UserId) -> Result<Profile, Error> {
        let u = self.user(id)?;
        Ok(Profile {
            user: self.summary(id),
            followers: self.followers_of(id),
            following: self.following_of(id),
            created_at: u.created_at,
            updated_at: u.updated_at,
        })
    }

    fn followers_of(&self, id: UserId) -> Vec<UserSummary> {
        self.follows
            .iter()
            .filter(|(_, followee)| *followee == id)
            .map(|(follower, _)| self.summary(*follower))
            .collect()
    }

    fn following_of(&self, id: UserId) -> Vec<UserSummary> {
        self.follows
            .iter()
            .filter(|(follower, _)| *follower == id)
            .map(|(_, followee)| self.summary(*followee))
            .collect()
    }

    pub fn profile(&self, tok: &AuthToken) -> Result<Profile, Error> {
        let me = self.authenticate(tok)?;
        self.profile_of(me)
    }

    pub fn user_profile(&self, id: UserId) -> Result<Profile, Error> {
        self.profile_of(id)
    }

    pub fn update_profile(
        &mut self,
        tok: &AuthToken,
        data: ProfileUpdate,
    ) -> Result<ProfileUpdated, Error> {
        let me = self.authenticate(tok)?;
        data.validate()?;
        let current = self.summary(me);
        let mut changed = false;
        let mut username = current.username.clone();
        let mut email = current.email.clone();
        if let Some(u) = data.username() {
            if u != current.username {
                if self.users.iter().any(|o| o.username == u) {
                    return Err(Error::conflict("Username already exists"));
                }
                username = String::from(u);
                changed = true;
            }
        }
        if let Some(e) = data.email() {
            if e != current.email {
                if self.users.iter().any(|o| o.email == e) {
                    return Err(Error::conflict("Email already exists"));
                }
                email = String::from(e);
                changed = true;
            }
        }
        if changed {
            let u = self.user_mut(me)?;
            u.username = username;
            u.email = email;
            u.updated_at = Utc::now();
        }
        Ok(ProfileUpdated {
            message: String::from("Profile updated successfully"),
            user: self.summary(me),
        })
    }

    /// `picture` is the reference of the uploaded file, if the request carried one
    pub fn upload_profile_picture(
        &mut self,
        tok: &AuthToken,
        picture: Option<String>,
    ) -> Result<ProfilePicture, Error> {
        let me = self.authenticate(tok)?;
        let picture = picture.ok_or_else(|| Error::validation("No file uploaded"))?;
        let u = self.user_mut(me)?;
        let previous = u.profile_picture.replace(picture.clone());
        u.updated_at = Utc::now();
        if let Some(previous) = previous {
            self.files.remove(&previous);
        }
        self.files.insert(picture.clone());
        Ok(ProfilePicture {
            message: String::from("Profile picture uploaded successfully"),
            profile_picture: picture,
        })
    }

    pub fn delete_profile_picture(&mut self, tok: &AuthToken) -> Result<Message, Error> {
        let me = self.authenticate(tok)?;
        let u = self.user_mut(me)?;
        let previous = u
            .profile_picture
            .take()
            .ok_or_else(|| Error::validation("No profile picture to delete"))?;
        u.updated_at = Utc::now();
        self.files.remove(&previous);
        Ok(Message::new("Profile picture deleted successfully"))
    }

    pub fn follow(&mut self, tok: &AuthToken, target: UserId) -> Result<Message, Error> {
        let me = self.authenticate(tok)?;
        if me == target {
            return Err(Error::validation("You cannot follow yourself"));
        }
        self.user(target)?;
        if self.follows.contains(&(me, target)) {
            return Err(Error::conflict("Already following this user"));
        }
        self.follows.push((me, target));
        Ok(Message::new("User followed successfully"))
    }

    pub fn unfollow(&mut self, tok: &AuthToken, target: UserId) -> Result<Message, Error> {
        let me = self.authenticate(tok)?;
        if me == target {
            return Err(Error::validation("You cannot unfollow yourself"));
        }
        self.user(target)?;
        let len = self.follows.len();
        self.follows.retain(|e| *e != (me, target));
        if self.follows.len() == len {
            return Err(Error::conflict("Not following this user"));
        }
        Ok(Message::new("User unfollowed successfully"))
    }

    pub fn followers(&self, id: UserId) -> Result<Followers, Error> {
        self.user(id)?;
        Ok(Followers {
            followers: self.followers_of(id),
        })
    }

    pub fn following(&self, id: UserId) -> Result<Following, Error> {
        self.user(id)?;
        Ok(Following {
            following: self.following_of(id),
        })
    }

    pub fn search_users(&self, tok: &AuthToken, q: UserSearch) -> Result<Vec<SearchHit>, Error> {
        let me = self.authenticate(tok)?;
        let needle = q.needle()?.to_lowercase();
        Ok(self
            .users
            .iter()
            .filter(|u| u.id != me && u.username.to_lowercase().contains(&needle))
            .take(SEARCH_RESULTS_LIMIT as usize)
            .map(|u| SearchHit {
                user: self.summary(u.id),
                is_following: self.follows.contains(&(me, u.id)),
            })
            .collect())
    }

    fn post_view(&self, p: &MockPost) -> Post {
        let reactions = |liked: bool| -> Vec<UserId> {
            self.reactions
                .iter()
                .filter(|(post, _, l)| *post == p.id && *l == liked)
                .map(|(_, user, _)| *user)
                .collect()
        };
        Post {
            id: p.id,
            title: p.title.clone(),
            content: p.content.clone(),
            owner: self.summary(p.owner),
            images: p.images.clone(),
            likes: reactions(true),
            dislikes: reactions(false),
            created_at: p.created_at,
            updated_at: p.updated_at,
            comment_count: self
                .comments
                .iter()
                .filter(|c| c.post == p.id && c.parent.is_none() && !c.is_deleted)
                .count() as i64,
        }
    }

    fn post_idx(&self, id: PostId) -> Result<usize, Error> {
        self.posts
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(Error::post_not_found)
    }

    pub fn list_posts(&self, q: PostQuery) -> Result<PostPage, Error> {
        let l = q.resolve()?;
        let needle = l.search.as_ref().map(|s| s.to_lowercase());
        let mut matching: Vec<&MockPost> = self
            .posts
            .iter()
            .filter(|p| match &needle {
                None => true,
                Some(n) => p.title.to_lowercase().contains(n) || p.content.to_lowercase().contains(n),
            })
            .collect();
        matching.sort_by(|a, b| {
            let ord = match l.sort.key {
                SortKey::CreatedAt => a.created_at.cmp(&b.created_at),
                SortKey::UpdatedAt => a.updated_at.cmp(&b.updated_at),
                SortKey::Title => a.title.as_bytes().cmp(b.title.as_bytes()),
            }
            .then(a.seq.cmp(&b.seq));
            match l.sort.descending {
                true => ord.reverse(),
                false => ord,
            }
        });
        let total_posts = matching.len() as i64;
        let offset = usize::try_from(l.offset()).unwrap_or(usize::MAX);
        let limit = usize::try_from(l.limit).unwrap_or(usize::MAX);
        Ok(PostPage {
            posts: matching
                .into_iter()
                .skip(offset)
                .take(limit)
                .map(|p| self.post_view(p))
                .collect(),
            total_posts,
            total_pages: l.total_pages(total_posts),
            current_page: l.page,
        })
    }

    fn posts_of(&self, owner: UserId) -> PostList {
        let mut posts: Vec<&MockPost> = self.posts.iter().filter(|p| p.owner == owner).collect();
        posts.sort_by(|a, b| (b.created_at, b.seq).cmp(&(a.created_at, a.seq)));
        PostList {
            posts: posts.into_iter().map(|p| self.post_view(p)).collect(),
        }
    }

    pub fn own_posts(&self, tok: &AuthToken) -> Result<PostList, Error> {
        let me = self.authenticate(tok)?;
        Ok(self.posts_of(me))
    }

    pub fn user_posts(&self, owner: UserId) -> Result<PostList, Error> {
        Ok(self.posts_of(owner))
    }

    pub fn post(&self, id: PostId) -> Result<Post, Error> {
        Ok(self.post_view(&self.posts[self.post_idx(id)?]))
    }

    /// `images` are the references of the files uploaded along with the form
    pub fn create_post(
        &mut self,
        tok: &AuthToken,
        data: NewPost,
        images: Vec<String>,
    ) -> Result<Post, Error> {
        let me = self.authenticate(tok)?;
        let (title, content) = data.validate()?;
        let (title, content) = (String::from(title), String::from(content));
        let now = Utc::now();
        let seq = self.seq();
        self.files.extend(images.iter().cloned());
        self.posts.push(MockPost {
            id: PostId(Uuid::new_v4()),
            seq,
            owner: me,
            title,
            content,
            images,
            created_at: now,
            updated_at: now,
        });
        Ok(self.post_view(&self.posts[self.posts.len() - 1]))
    }

    pub fn update_post(
        &mut self,
        tok: &AuthToken,
        id: PostId,
        patch: PostPatch,
        images: Vec<String>,
    ) -> Result<Post, Error> {
        let me = self.authenticate(tok)?;
        patch.validate()?;
        let idx = self.post_idx(id)?;
        let p = &mut self.posts[idx];
        if p.owner != me {
            return Err(Error::forbidden(
                "You don't have permission to update this post",
            ));
        }
        if let Some(title) = patch.title {
            p.title = title;
        }
        if let Some(content) = patch.content {
            p.content = content;
        }
        p.images.extend(images.iter().cloned());
        p.updated_at = Utc::now();
        self.files.extend(images);
        Ok(self.post_view(&self.posts[idx]))
    }

    pub fn delete_post(&mut self, tok: &AuthToken, id: PostId) -> Result<Message, Error> {
        let me = self.authenticate(tok)?;
        let idx = self.post_idx(id)?;
        if self.posts[idx].owner != me {
            return Err(Error::forbidden(
                "You don't have permission to delete this post",
            ));
        }
        let p = self.posts.remove(idx);
        for i in &p.images {
            self.files.remove(i);
        }
        self.comments.retain(|c| c.post != id);
        self.reactions.retain(|(post, _, _)| *post != id);
        Ok(Message::new("Post deleted successfully"))
    }

    pub fn delete_post_image(
        &mut self,
        tok: &AuthToken,
        id: PostId,
        index: &str,
    ) -> Result<Message, Error> {
        let me = self.authenticate(tok)?;
        let idx = self.post_idx(id)?;
        let p = &mut self.posts[idx];
        if p.owner != me {
            return Err(Error::forbidden(
                "You don't have permission to delete this image",
            ));
        }
        let index = gemlog_api::parse_image_index(index, p.images.len())?;
        let removed = p.images.remove(index);
        p.updated_at = Utc::now();
        self.files.remove(&removed);
        Ok(Message::new("Image deleted successfully"))
    }

    pub fn react(
        &mut self,
        tok: &AuthToken,
        id: PostId,
        reaction: Reaction,
    ) -> Result<Message, Error> {
        let me = self.authenticate(tok)?;
        self.post_idx(id)?;
        let current = self
            .reactions
            .iter()
            .find(|(post, user, _)| *post == id && *user == me)
            .map(|(_, _, liked)| *liked);
        let target = reaction.apply(current)?;
        self.reactions
            .retain(|(post, user, _)| !(*post == id && *user == me));
        if let Some(liked) = target {
            self.reactions.push((id, me, liked));
        }
        Ok(Message::new(reaction.success_message()))
    }

    fn comment_view(&self, c: &MockComment) -> Comment {
        Comment {
            id: c.id,
            post_id: c.post,
            author: self.summary(c.author),
            content: c.content.clone(),
            parent_comment_id: c.parent,
            is_deleted: c.is_deleted,
            deleted_at: c.deleted_at,
            created_at: c.created_at,
            updated_at: c.updated_at,
        }
    }

    fn visible_comment(&self, id: CommentId) -> Option<usize> {
        self.comments
            .iter()
            .position(|c| c.id == id && !c.is_deleted)
    }

    /// Visible comments matching `filter`, oldest first
    fn comments_where(&self, filter: impl Fn(&MockComment) -> bool) -> Vec<Comment> {
        let mut res: Vec<&MockComment> = self
            .comments
            .iter()
            .filter(|c| !c.is_deleted && filter(c))
            .collect();
        res.sort_by_key(|c| (c.created_at, c.seq));
        res.into_iter().map(|c| self.comment_view(c)).collect()
    }

    pub fn comments_for_post(&self, post: PostId) -> Result<Vec<CommentThread>, Error> {
        let mut roots = self.comments_where(|c| c.post == post && c.parent.is_none());
        roots.reverse();
        let descendants = self.comments_where(|c| c.parent.is_some());
        Ok(assemble_threads(roots, descendants, self.thread_depth))
    }

    pub fn replies(&self, id: CommentId) -> Result<Vec<Comment>, Error> {
        self.visible_comment(id)
            .ok_or_else(Error::comment_not_found)?;
        Ok(self.comments_where(|c| c.parent == Some(id)))
    }

    fn insert_comment(
        &mut self,
        author: UserId,
        post: Option<PostId>,
        parent: Option<CommentId>,
        content: &str,
    ) -> Result<Comment, Error> {
        let post = match parent {
            Some(parent) => {
                let idx = self
                    .visible_comment(parent)
                    .ok_or_else(|| Error::not_found("Parent comment not found"))?;
                self.comments[idx].post
            }
            None => {
                let post =
                    post.ok_or_else(|| Error::validation("Content and postId are required"))?;
                self.post_idx(post)?;
                post
            }
        };
        let now = Utc::now();
        let seq = self.seq();
        self.comments.push(MockComment {
            id: CommentId(Uuid::new_v4()),
            seq,
            post,
            author,
            parent,
            content: String::from(content),
            is_deleted: false,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        });
        Ok(self.comment_view(&self.comments[self.comments.len() - 1]))
    }

    pub fn create_comment(&mut self, tok: &AuthToken, data: NewComment) -> Result<Comment, Error> {
        let me = self.authenticate(tok)?;
        let (post, content) = data.validate()?;
        self.insert_comment(me, Some(post), data.parent_comment_id, content)
    }

    pub fn create_reply(
        &mut self,
        tok: &AuthToken,
        parent: CommentId,
        data: NewReply,
    ) -> Result<Comment, Error> {
        let me = self.authenticate(tok)?;
        let content = data.validate()?;
        self.insert_comment(me, None, Some(parent), content)
    }

    fn own_comment(&self, me: UserId, id: CommentId, action: &str) -> Result<usize, Error> {
        let idx = self
            .visible_comment(id)
            .ok_or_else(Error::comment_not_found)?;
        if self.comments[idx].author != me {
            return Err(Error::forbidden(&format!(
                "Not authorized to {action} this comment"
            )));
        }
        Ok(idx)
    }

    pub fn update_comment(
        &mut self,
        tok: &AuthToken,
        id: CommentId,
        data: CommentEdit,
    ) -> Result<Comment, Error> {
        let me = self.authenticate(tok)?;
        let content = String::from(data.validate()?);
        let idx = self.own_comment(me, id, "update")?;
        let c = &mut self.comments[idx];
        c.content = content;
        c.updated_at = Utc::now();
        Ok(self.comment_view(&self.comments[idx]))
    }

    pub fn delete_comment(&mut self, tok: &AuthToken, id: CommentId) -> Result<Message, Error> {
        let me = self.authenticate(tok)?;
        let idx = self.own_comment(me, id, "delete")?;
        let now = Utc::now();
        let c = &mut self.comments[idx];
        c.is_deleted = true;
        c.deleted_at = Some(now);
        c.content = String::from(DELETED_COMMENT);
        c.updated_at = now;
        for c in self.comments.iter_mut().filter(|c| c.parent == Some(id)) {
            c.is_deleted = true;
            c.deleted_at = Some(now);
            c.content = String::from(DELETED_REPLY);
            c.updated_at = now;
        }
        Ok(Message::new("Comment and all replies deleted successfully"))
    }
}
